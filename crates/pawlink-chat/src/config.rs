use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ChatError, Result};

/// Debounce window after the last keystroke before `stop_typing` is emitted.
pub const TYPING_QUIET_PERIOD: Duration = Duration::from_secs(2);

/// Remote "is typing" is cleared after this long without a refresh or message.
pub const REMOTE_TYPING_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub api_url: String,
    pub gateway_url: String,
    pub token_path: PathBuf,
    pub typing_quiet_period: Duration,
    pub remote_typing_timeout: Duration,
    pub request_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:4000".into(),
            gateway_url: "ws://127.0.0.1:4000/gateway".into(),
            token_path: PathBuf::from("pawlink.token"),
            typing_quiet_period: TYPING_QUIET_PERIOD,
            remote_typing_timeout: REMOTE_TYPING_TIMEOUT,
            request_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

impl ChatConfig {
    /// Read config from `PAWLINK_*` environment variables. Callers load `.env`
    /// beforehand if they want one.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let millis = |key: &'static str, default: Duration| -> Result<Duration> {
            match lookup(key) {
                Some(raw) => match raw.trim().parse::<u64>() {
                    Ok(ms) => Ok(Duration::from_millis(ms)),
                    Err(_) => Err(ChatError::Config { key, value: raw }),
                },
                None => Ok(default),
            }
        };

        Ok(Self {
            api_url: lookup("PAWLINK_API_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.api_url),
            gateway_url: lookup("PAWLINK_GATEWAY_URL").unwrap_or(defaults.gateway_url),
            token_path: lookup("PAWLINK_TOKEN_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.token_path),
            typing_quiet_period: millis("PAWLINK_TYPING_QUIET_MS", defaults.typing_quiet_period)?,
            remote_typing_timeout: millis(
                "PAWLINK_REMOTE_TYPING_TIMEOUT_MS",
                defaults.remote_typing_timeout,
            )?,
            request_timeout: millis("PAWLINK_REQUEST_TIMEOUT_MS", defaults.request_timeout)?,
            reconnect_delay: millis("PAWLINK_RECONNECT_DELAY_MS", defaults.reconnect_delay)?,
        })
    }
}
