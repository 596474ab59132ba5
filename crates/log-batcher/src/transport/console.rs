// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::TransportError;
use crate::record::{Batch, FormattedRecord, RecordKind};
use crate::transport::Transport;

pub(crate) const NAME: &str = "console";

const INDENT: &str = "  ";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleFormat {
    /// Human readable, one line per record, groups indented.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConsoleStream {
    #[default]
    Stdout,
    Stderr,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConsoleConfig {
    pub format: ConsoleFormat,
    pub stream: ConsoleStream,
}

/// Writes batches to the process's standard output or error.
///
/// Group depth is carried across batches, so a group opened in one batch
/// still indents records that arrive in the next.
#[derive(Debug, Default)]
pub struct ConsoleTransport {
    config: ConsoleConfig,
    group_depth: AtomicUsize,
}

impl ConsoleTransport {
    #[must_use]
    pub fn new(config: ConsoleConfig) -> Self {
        Self {
            config,
            group_depth: AtomicUsize::new(0),
        }
    }

    pub fn group_depth(&self) -> usize {
        self.group_depth.load(Ordering::Acquire)
    }

    /// Renders a batch into the bytes written by [`Transport::send`].
    pub fn render(&self, batch: &Batch) -> Result<String, serde_json::Error> {
        let mut out = String::new();
        for record in &batch.records {
            match self.config.format {
                ConsoleFormat::Json => {
                    out.push_str(&serde_json::to_string(record)?);
                    out.push('\n');
                }
                ConsoleFormat::Text => self.render_text(record, &mut out),
            }
        }
        Ok(out)
    }

    fn render_text(&self, record: &FormattedRecord, out: &mut String) {
        match record.kind {
            RecordKind::GroupEnd => {
                // Unbalanced group ends are ignored.
                let _ = self
                    .group_depth
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| d.checked_sub(1));
                if !record.message.is_empty() {
                    self.push_line(record, self.group_depth(), out);
                }
            }
            RecordKind::Group => {
                self.push_line(record, self.group_depth(), out);
                self.group_depth.fetch_add(1, Ordering::AcqRel);
            }
            RecordKind::Table => {
                let depth = self.group_depth();
                let _ = writeln!(
                    out,
                    "{} {:<6} {}{}",
                    record.timestamp_ms,
                    record.level.as_ref(),
                    INDENT.repeat(depth),
                    record.message
                );
                for row in &record.payload {
                    let rows = match row {
                        serde_json::Value::Array(items) => items.iter().collect::<Vec<_>>(),
                        other => vec![other],
                    };
                    for (index, item) in rows.into_iter().enumerate() {
                        let _ = writeln!(out, "{}{INDENT}[{index}] {item}", INDENT.repeat(depth));
                    }
                }
            }
            RecordKind::Plain => self.push_line(record, self.group_depth(), out),
        }
    }

    fn push_line(&self, record: &FormattedRecord, depth: usize, out: &mut String) {
        let _ = write!(
            out,
            "{} {:<6} {}{}",
            record.timestamp_ms,
            record.level.as_ref(),
            INDENT.repeat(depth),
            record.message
        );
        for value in &record.payload {
            match value {
                serde_json::Value::String(s) => {
                    let _ = write!(out, " {s}");
                }
                other => {
                    let _ = write!(out, " {other}");
                }
            }
        }
        out.push('\n');
    }
}

#[async_trait]
impl Transport for ConsoleTransport {
    fn name(&self) -> &str {
        NAME
    }

    async fn send(&self, batch: &Batch) -> Result<(), TransportError> {
        let rendered = self
            .render(batch)
            .map_err(|e| TransportError::new(NAME, e.to_string()))?;
        let result = match self.config.stream {
            ConsoleStream::Stdout => {
                let mut stdout = tokio::io::stdout();
                match stdout.write_all(rendered.as_bytes()).await {
                    Ok(()) => stdout.flush().await,
                    Err(e) => Err(e),
                }
            }
            ConsoleStream::Stderr => {
                let mut stderr = tokio::io::stderr();
                match stderr.write_all(rendered.as_bytes()).await {
                    Ok(()) => stderr.flush().await,
                    Err(e) => Err(e),
                }
            }
        };
        result.map_err(|e| TransportError::new(NAME, e.to_string()))
    }
}
