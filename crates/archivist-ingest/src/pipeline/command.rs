//! Bot commands.
//!
//! Messages the bot's own account sends with the command prefix are not
//! indexed. They are parsed here, answered with plain-text notice pages and
//! then redacted.
//!
//! ```text
//! !archivist last 50
//! !archivist search deploy window
//! ```

use crate::api::HomeserverApi;
use crate::storage::{SearchQuery, SearchStorage};
use crate::Result;
use archivist_core::IndexedDocument;
use chrono::DateTime;
use metrics::counter;
use serde_json::json;
use std::sync::Arc;

/// Upper bound for `last <N>` and for search hits.
pub const MAX_RESULTS: usize = 500;

/// A parsed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// The newest N indexed messages of the room.
    Last(usize),
    /// Messages in the room matching a term.
    Search(String),
}

/// Parse a message body as a command.
///
/// Returns `None` when the body does not start with `prefix` followed by
/// whitespace or the end of the message, and `Some(Err(reason))` when it
/// does but the rest is not a valid command.
pub fn parse_command(prefix: &str, body: &str) -> Option<std::result::Result<Command, String>> {
    let rest = body.trim().strip_prefix(prefix)?;
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }

    let rest = rest.trim();
    let (verb, argument) = match rest.split_once(char::is_whitespace) {
        Some((verb, argument)) => (verb, argument.trim()),
        None => (rest, ""),
    };

    let command = match verb {
        "last" => match argument.parse::<usize>() {
            Ok(n) if (1..=MAX_RESULTS).contains(&n) => Ok(Command::Last(n)),
            _ => Err(format!("`last` expects a number between 1 and {MAX_RESULTS}")),
        },
        "search" if !argument.is_empty() => Ok(Command::Search(argument.to_string())),
        "search" => Err("`search` expects a term".to_string()),
        "" => Err("missing command".to_string()),
        other => Err(format!("unknown command `{other}`")),
    };
    Some(command)
}

fn format_timestamp(ts_ms: i64) -> String {
    DateTime::from_timestamp_millis(ts_ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "????-??-?? ??:??".to_string())
}

fn format_hit(doc: &IndexedDocument) -> String {
    format!(
        "[{}] {}: {}",
        format_timestamp(doc.origin_server_ts),
        doc.sender,
        doc.body().unwrap_or_default()
    )
}

/// Render hits as plain-text pages of at most `page_size` lines each.
pub fn render_pages(title: &str, hits: &[IndexedDocument], page_size: usize) -> Vec<String> {
    if hits.is_empty() {
        return vec![format!("{title}: no messages found")];
    }

    let chunks: Vec<&[IndexedDocument]> = hits.chunks(page_size.max(1)).collect();
    let total = chunks.len();
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let mut page = format!("{title} (page {}/{total})", i + 1);
            for doc in *chunk {
                page.push('\n');
                page.push_str(&format_hit(doc));
            }
            page
        })
        .collect()
}

/// Executes commands against search storage and answers in the room.
pub struct CommandHandler {
    api: Arc<dyn HomeserverApi>,
    storage: Arc<dyn SearchStorage>,
    prefix: String,
    page_size: usize,
}

impl CommandHandler {
    pub fn new(
        api: Arc<dyn HomeserverApi>,
        storage: Arc<dyn SearchStorage>,
        prefix: impl Into<String>,
        page_size: usize,
    ) -> Self {
        Self {
            api,
            storage,
            prefix: prefix.into(),
            page_size,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Answer `command` in `room_id`, then redact the command event.
    ///
    /// Returns the number of pages sent.
    pub async fn handle(
        &self,
        room_id: &str,
        event_id: &str,
        command: std::result::Result<Command, String>,
    ) -> Result<usize> {
        let pages = match command {
            Ok(Command::Last(n)) => {
                let query = SearchQuery::new("").in_room(room_id).with_limit(n);
                let hits = self.storage.query(&query).await?;
                render_pages(&format!("Last {n} messages"), &hits, self.page_size)
            }
            Ok(Command::Search(term)) => {
                let query = SearchQuery::new(term.clone())
                    .in_room(room_id)
                    .with_limit(MAX_RESULTS);
                let hits = self.storage.query(&query).await?;
                render_pages(&format!("Results for \"{term}\""), &hits, self.page_size)
            }
            Err(reason) => vec![format!(
                "{reason}\nUsage: {prefix} last <N> | {prefix} search <term>",
                prefix = self.prefix
            )],
        };

        for page in &pages {
            let content = json!({ "msgtype": "m.notice", "body": page });
            self.api.send_message(room_id, &content).await?;
        }

        self.api
            .redact(room_id, event_id, Some("command handled"))
            .await?;

        counter!("commands_handled_total").increment(1);
        tracing::info!("Handled command {} in {} ({} pages)", event_id, room_id, pages.len());
        Ok(pages.len())
    }
}
