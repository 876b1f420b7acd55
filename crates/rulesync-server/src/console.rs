//! Line commands for driving a master node from stdin.
//!
//! ```text
//! add {"id": "r1", "pattern": "timer.*"}
//! delete r1
//! list
//! ```

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

use rulesync_core::{RuleChangeSource, RuleStore};
use rulesync_proto::{Rule, RuleId};

use crate::error::Error;

/// A parsed console line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Insert or replace a rule.
    Add(Rule),
    /// Remove a rule by id.
    Delete(RuleId),
    /// Print every rule.
    List,
    Help,
}

/// Parse one line. Blank lines and `#` comments yield `None`.
pub fn parse_command(line: &str) -> Result<Option<Command>, Error> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut parts = line.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or_default().to_lowercase();
    let arg = parts.next().map(str::trim).filter(|arg| !arg.is_empty());

    let command = match (command.as_str(), arg) {
        ("add", Some(json)) => Command::Add(serde_json::from_str(json)?),
        ("add", None) => return Err(Error::Command("usage: add <rule-json>".to_string())),
        ("delete" | "del", Some(id)) => Command::Delete(id.to_string()),
        ("delete" | "del", None) => return Err(Error::Command("usage: delete <id>".to_string())),
        ("list" | "ls", _) => Command::List,
        ("help" | "?", _) => Command::Help,
        (other, _) => return Err(Error::Command(format!("unknown command '{}'", other))),
    };
    Ok(Some(command))
}

fn help() -> &'static str {
    "commands:\n  add <rule-json>   insert or replace a rule\n  delete <id>       remove a rule\n  list              print all rules\n"
}

/// Read commands from `input` until it ends, applying them to `store` and
/// writing replies to `output`.
pub async fn run_console<R, W>(input: R, mut output: W, store: Arc<RuleStore>) -> Result<(), Error>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();

    while let Some(line) = lines.next_line().await? {
        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "ignoring console line");
                output.write_all(format!("error: {}\n", e).as_bytes()).await?;
                continue;
            }
        };

        match command {
            Command::Add(rule) => {
                info!(rule = %rule.id, "adding rule from console");
                store.put(rule).await;
            }
            Command::Delete(id) => match store.delete(&id).await {
                Some(_) => info!(rule = %id, "deleted rule from console"),
                None => {
                    output
                        .write_all(format!("no rule '{}'\n", id).as_bytes())
                        .await?
                }
            },
            Command::List => {
                for rule in store.rules() {
                    let json = serde_json::to_string(&rule)?;
                    output.write_all(json.as_bytes()).await?;
                    output.write_all(b"\n").await?;
                }
            }
            Command::Help => output.write_all(help().as_bytes()).await?,
        }
        output.flush().await?;
    }

    Ok(())
}
