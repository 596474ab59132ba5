// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::formatter::CycleSafeFormatter;
use crate::level::LogLevel;
use crate::value::Value;

/// Shape of a record. Console transports render groups and tables specially.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordKind {
    #[default]
    Plain,
    Group,
    GroupEnd,
    Table,
}

/// A record as submitted by the caller, before formatting.
#[derive(Clone, Debug)]
pub struct LogRecord {
    pub created_at: Instant,
    pub timestamp_ms: u64,
    pub level: LogLevel,
    pub message: String,
    pub payload: Vec<Value>,
    pub kind: RecordKind,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<String>, payload: Vec<Value>) -> Self {
        Self {
            created_at: Instant::now(),
            timestamp_ms: now_ms(),
            level,
            message: message.into(),
            payload,
            kind: RecordKind::Plain,
        }
    }

    #[must_use]
    pub fn with_kind(mut self, kind: RecordKind) -> Self {
        self.kind = kind;
        self
    }
}

/// A record after its payload went through the [`CycleSafeFormatter`].
///
/// This is the form held in a batch and handed to transports. It no longer
/// references caller data, so later mutation of a payload cannot affect it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FormattedRecord {
    /// Admission order within one aggregator, starting at 0.
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<serde_json::Value>,
    #[serde(rename = "type", default)]
    pub kind: RecordKind,
}

impl FormattedRecord {
    pub fn from_record(sequence: u64, record: &LogRecord, formatter: &CycleSafeFormatter) -> Self {
        Self {
            sequence,
            timestamp_ms: record.timestamp_ms,
            level: record.level,
            message: record.message.clone(),
            payload: formatter.format_all(&record.payload),
            kind: record.kind,
        }
    }

    /// Approximate in-memory footprint, used for the memory budget.
    pub fn estimated_size(&self) -> usize {
        let mut size = std::mem::size_of::<Self>() + self.message.len();
        let mut stack: Vec<&serde_json::Value> = self.payload.iter().collect();
        while let Some(value) = stack.pop() {
            size += std::mem::size_of::<serde_json::Value>();
            match value {
                serde_json::Value::String(s) => size += s.len(),
                serde_json::Value::Array(items) => stack.extend(items.iter()),
                serde_json::Value::Object(map) => {
                    for (key, item) in map {
                        size += key.len();
                        stack.push(item);
                    }
                }
                _ => {}
            }
        }
        size
    }
}

/// What caused a batch to be cut.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    Size,
    Deadline,
    MemoryPressure,
    Manual,
}

impl std::fmt::Display for FlushReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FlushReason::Size => "size",
            FlushReason::Deadline => "deadline",
            FlushReason::MemoryPressure => "memory_pressure",
            FlushReason::Manual => "manual",
        })
    }
}

/// An ordered group of records dispatched together.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Monotonic per aggregator, starting at 1.
    pub id: u64,
    pub reason: FlushReason,
    pub records: Vec<FormattedRecord>,
}

impl Batch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// JSON array of the batch's records.
    ///
    /// # Errors
    ///
    /// Fails only if a record cannot be serialized, which formatted records
    /// never trigger in practice.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.records)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
