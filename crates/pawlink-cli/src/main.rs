mod chat;

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::debug;

use pawlink_chat::token::{FileTokenStore, TokenStore};
use pawlink_chat::{ChatApi, ChatConfig, Connection, Identity};
use pawlink_types::{RoomId, UserId};

/// Used when `RUST_LOG` is unset. Logs go to stderr, next to the chat.
const DEFAULT_LOG_FILTER: &str = "pawlink=info";

#[derive(Parser)]
#[command(name = "pawlink", about = "Chat with pet owners, adopters and vets")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store the bearer token used for API calls
    Login { token: String },
    /// Forget the stored token
    Logout,
    /// List your conversations
    List,
    /// Start (or reopen) the conversation about a pet
    Initiate { pet_id: String },
    /// Open a room and chat interactively
    Chat {
        room_id: String,
        /// Your user id, as known to the gateway
        #[arg(long)]
        user: String,
        /// Name shown to the other participant
        #[arg(long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = ChatConfig::from_env().context("invalid configuration")?;
    debug!("Using API {} and gateway {}", config.api_url, config.gateway_url);

    let tokens: Arc<dyn TokenStore> = Arc::new(FileTokenStore::new(&config.token_path));

    match cli.command {
        Command::Login { token } => {
            tokens.save(&token)?;
            println!("Token saved to {}", config.token_path.display());
        }

        Command::Logout => {
            tokens.clear()?;
            println!("Logged out");
        }

        Command::List => {
            let api = ChatApi::new(&config, tokens)?;
            let chats = api.list().await?;
            if chats.is_empty() {
                println!("No conversations yet");
            }
            for chat in chats {
                let with = chat
                    .other_participant
                    .and_then(|p| p.name.or_else(|| p.id.map(|id| id.to_string())))
                    .unwrap_or_else(|| "?".into());
                println!(
                    "{}  {:<16} {:<12} {}  {}",
                    chat.id,
                    with,
                    chat.pet_name.unwrap_or_default(),
                    chat.updated_at.format("%Y-%m-%d %H:%M"),
                    chat.last_message.unwrap_or_default(),
                );
            }
        }

        Command::Initiate { pet_id } => {
            let api = ChatApi::new(&config, tokens)?;
            let room_id = api.initiate(&pet_id).await?;
            println!("{}", room_id);
        }

        Command::Chat {
            room_id,
            user,
            name,
        } => {
            let api = ChatApi::new(&config, tokens.clone())?;

            // One shared connection for the whole process
            let connection = Connection::from_config(&config);
            connection.connect();

            let identity = Identity {
                user_id: UserId::new(user),
                display_name: name,
            };
            let result = chat::run(
                connection.clone(),
                api,
                tokens,
                identity,
                RoomId::new(room_id),
                &config,
            )
            .await;
            connection.shutdown();
            result?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn default_filter_is_info_for_pawlink_crates() {
        let filter = EnvFilter::try_new(DEFAULT_LOG_FILTER).unwrap();
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::INFO));
    }

    #[test]
    fn chat_subcommand_parses() {
        let cli = Cli::try_parse_from(["pawlink", "chat", "42", "--user", "u1"]).unwrap();
        let Command::Chat { room_id, user, name } = cli.command else {
            panic!("expected chat subcommand");
        };
        assert_eq!(room_id, "42");
        assert_eq!(user, "u1");
        assert!(name.is_none());
    }
}
