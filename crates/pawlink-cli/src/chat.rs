use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use pawlink_chat::presenter::{Alignment, ViewState};
use pawlink_chat::token::TokenStore;
use pawlink_chat::{
    ChatApi, ChatConfig, ChatError, ChatSession, Connection, Identity, SessionUpdate,
};
use pawlink_types::RoomId;

/// Interactive room loop: stdin lines are messages, gateway updates are printed.
pub async fn run(
    connection: Connection,
    api: ChatApi,
    tokens: Arc<dyn TokenStore>,
    identity: Identity,
    room_id: RoomId,
    config: &ChatConfig,
) -> anyhow::Result<()> {
    let mut session = ChatSession::open(connection, api, identity, room_id, config)?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut printed = 0;

    println!("Joined room {} (/room <id> to switch, /quit to leave)", session.room_id());

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim_end();

                if line == "/quit" {
                    break;
                }
                if let Some(next) = line.strip_prefix("/room ") {
                    session.switch_room(RoomId::from(next.trim()))?;
                    printed = 0;
                    println!("-- switched to room {} --", session.room_id());
                    continue;
                }

                session.input_changed()?;
                match session.send(line) {
                    Ok(()) => {}
                    Err(ChatError::EmptyMessage) => {}
                    // The line is gone either way; the user retypes it
                    Err(e) => println!("!! message not sent: {}", e),
                }
            }
            update = session.next_update() => {
                let Some(update) = update else { break };
                match update {
                    SessionUpdate::HistoryFailed { reason } => {
                        if tokens.token().is_none() {
                            println!("!! {}", ChatError::Unauthorized);
                            break;
                        }
                        println!("!! could not load history: {}", reason);
                    }
                    SessionUpdate::RemoteTyping(true) => println!("   ...typing"),
                    SessionUpdate::Resync { skipped } => {
                        println!("-- missed {} events, reloading the room --", skipped);
                        printed = 0;
                    }
                    _ => {}
                }

                let view = session.view();
                printed = print_new_rows(&view, printed);
            }
        }
    }

    Ok(())
}

fn print_new_rows(view: &ViewState, printed: usize) -> usize {
    if view.rows.len() < printed {
        warn!("View shrank from {} to {} rows", printed, view.rows.len());
        return view.rows.len();
    }

    for row in &view.rows[printed..] {
        match row.alignment {
            Alignment::Outgoing => println!("{:>40} [{}]", row.body, row.time_label),
            Alignment::Incoming => {
                println!("[{}] {}: {}", row.time_label, row.sender_label, row.body)
            }
        }
    }
    view.rows.len()
}
