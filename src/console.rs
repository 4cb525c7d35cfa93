//! Operator console
//!
//! Line-oriented commands read from stdin:
//!
//! | Input | Effect |
//! |---|---|
//! | `blocked` | list blocked URLs |
//! | `cached` | list cached URLs |
//! | `stats` | print metrics |
//! | `close`, `q`, `Q` | shut the proxy down |
//! | anything else | block that URL |

use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::metrics::ProxyMetrics;
use crate::request::CanonicalUrl;
use crate::server::ProxyState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    ListBlocked,
    ListCached,
    Stats,
    Shutdown,
    Block(CanonicalUrl),
}

impl ConsoleCommand {
    /// Parse one input line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let input = line.trim();
        if input.is_empty() {
            return None;
        }

        let command = match input {
            "close" | "q" | "Q" => Self::Shutdown,
            _ if input.eq_ignore_ascii_case("blocked") => Self::ListBlocked,
            _ if input.eq_ignore_ascii_case("cached") => Self::ListCached,
            _ if input.eq_ignore_ascii_case("stats") => Self::Stats,
            _ => Self::Block(CanonicalUrl::new(input)),
        };
        Some(command)
    }
}

/// Run commands from `input` until shutdown is requested or input ends
///
/// End of input only stops the console; the proxy keeps running.
pub async fn run_console<R, W>(
    input: R,
    mut output: W,
    state: &ProxyState,
    shutdown: CancellationToken,
) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    output
        .write_all(b"Enter a URL to block, or: blocked, cached, stats, close\n")
        .await?;
    output.flush().await?;

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            debug!("Console input closed");
            break;
        };
        let Some(command) = ConsoleCommand::parse(&line) else {
            continue;
        };

        match command {
            ConsoleCommand::ListBlocked => {
                let entries = state.blocklist.entries().await;
                output
                    .write_all(format!("Blocked sites ({}):\n", entries.len()).as_bytes())
                    .await?;
                for entry in entries {
                    output.write_all(format!("  {}\n", entry).as_bytes()).await?;
                }
            }
            ConsoleCommand::ListCached => {
                let keys = state.cache.keys().await;
                output
                    .write_all(format!("Cached sites ({}):\n", keys.len()).as_bytes())
                    .await?;
                for key in keys {
                    output.write_all(format!("  {}\n", key).as_bytes()).await?;
                }
            }
            ConsoleCommand::Stats => {
                output.write_all(ProxyMetrics::render().as_bytes()).await?;
            }
            ConsoleCommand::Shutdown => {
                info!("Shutdown requested from console");
                output.write_all(b"Closing proxy...\n").await?;
                output.flush().await?;
                shutdown.cancel();
                break;
            }
            ConsoleCommand::Block(url) => {
                let added = state.blocklist.add(url.clone()).await;
                let message = if added {
                    format!("{} blocked\n", url)
                } else {
                    format!("{} is already blocked\n", url)
                };
                output.write_all(message.as_bytes()).await?;
            }
        }
        output.flush().await?;
    }

    Ok(())
}
