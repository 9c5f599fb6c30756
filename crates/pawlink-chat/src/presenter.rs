use chrono::{FixedOffset, Local};

use pawlink_types::{ChatMessage, UserId};

const TIME_FORMAT: &str = "%H:%M";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    /// Sent by the local user
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayRow {
    pub body: String,
    pub sender_label: String,
    pub alignment: Alignment,
    pub time_label: String,
}

/// Everything a chat surface needs to draw one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewState {
    pub rows: Vec<DisplayRow>,
    pub loading: bool,
    pub load_failed: bool,
    pub remote_typing: bool,
    /// Jump to the newest row on this render
    pub scroll_to_latest: bool,
}

/// Maps stored messages to display rows.
pub struct Presenter {
    local_user: UserId,
    offset: FixedOffset,
}

impl Presenter {
    /// Times are shown in the machine's current UTC offset.
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            offset: *Local::now().offset(),
        }
    }

    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    pub fn row(&self, msg: &ChatMessage) -> DisplayRow {
        let alignment = if msg.sender_id == self.local_user {
            Alignment::Outgoing
        } else {
            Alignment::Incoming
        };

        let sender_label = match alignment {
            Alignment::Outgoing => "You".to_string(),
            Alignment::Incoming => msg
                .sender_display_name
                .clone()
                .unwrap_or_else(|| msg.sender_id.to_string()),
        };

        DisplayRow {
            body: msg.body.clone(),
            sender_label,
            alignment,
            time_label: msg
                .sent_at
                .with_timezone(&self.offset)
                .format(TIME_FORMAT)
                .to_string(),
        }
    }

    pub fn rows(&self, messages: &[ChatMessage]) -> Vec<DisplayRow> {
        messages.iter().map(|m| self.row(m)).collect()
    }
}

/// Tracks what was last shown so we know when to auto-scroll.
#[derive(Debug, Default)]
pub struct ScrollAnchor {
    last_len: usize,
    last_typing: bool,
}

impl ScrollAnchor {
    /// True when the row count or the typing indicator changed since the last call.
    pub fn observe(&mut self, len: usize, typing: bool) -> bool {
        let changed = len != self.last_len || typing != self.last_typing;
        self.last_len = len;
        self.last_typing = typing;
        changed
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
