//! Inbound event feed: one JSON `Event` per line from a file or stdin.

use std::path::Path;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tracing::warn;

use coordination::state::Event;

pub struct EventFeed {
    lines: Lines<BufReader<Box<dyn AsyncRead + Unpin + Send>>>,
    source: String,
    line_no: usize,
    skipped: usize,
}

impl EventFeed {
    /// Open `-` as stdin, anything else as a file path.
    pub async fn open(source: &str) -> Result<Self> {
        if source == "-" {
            return Ok(Self::from_reader("stdin", tokio::io::stdin()));
        }
        let file = tokio::fs::File::open(Path::new(source))
            .await
            .with_context(|| format!("Failed to open event feed {source}"))?;
        Ok(Self::from_reader(source, file))
    }

    pub fn from_reader(source: &str, reader: impl AsyncRead + Unpin + Send + 'static) -> Self {
        let boxed: Box<dyn AsyncRead + Unpin + Send> = Box::new(reader);
        Self {
            lines: BufReader::new(boxed).lines(),
            source: source.to_string(),
            line_no: 0,
            skipped: 0,
        }
    }

    /// Next well-formed event, or `None` at end of input.
    ///
    /// Blank lines are ignored; unparsable lines are logged and skipped.
    pub async fn next_event(&mut self) -> Result<Option<Event>> {
        while let Some(line) = self
            .lines
            .next_line()
            .await
            .with_context(|| format!("Failed to read {}", self.source))?
        {
            self.line_no += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Event>(trimmed) {
                Ok(event) => return Ok(Some(event)),
                Err(e) => {
                    self.skipped += 1;
                    warn!(source = %self.source, line = self.line_no, "Skipping malformed event: {e}");
                }
            }
        }
        Ok(None)
    }

    /// Lines dropped as malformed so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}
