// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns one line of stdin into a log record.
//!
//! Accepted shapes:
//!
//! ```text
//! plain text                        -> default level
//! warn: disk almost full            -> level prefix
//! {"level":"error","message":"x"}   -> JSON; other fields become the payload
//! ```

use log_batcher::{LogLevel, Value};
use serde_json::Map;
use std::str::FromStr;

#[derive(Debug, PartialEq)]
pub struct ParsedLine {
    pub level: LogLevel,
    pub message: String,
    pub payload: Vec<serde_json::Value>,
}

impl ParsedLine {
    pub fn payload_values(&self) -> Vec<Value> {
        self.payload.iter().cloned().map(Value::Json).collect()
    }
}

/// Returns `None` for blank lines.
pub fn parse_line(line: &str, default_level: LogLevel) -> Option<ParsedLine> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if line.starts_with('{') {
        if let Some(parsed) = parse_json(line, default_level) {
            return Some(parsed);
        }
    }
    Some(parse_prefixed(line, default_level))
}

fn parse_json(line: &str, default_level: LogLevel) -> Option<ParsedLine> {
    let mut fields: Map<String, serde_json::Value> = serde_json::from_str(line).ok()?;
    let message = match fields.remove("message")? {
        serde_json::Value::String(message) => message,
        other => other.to_string(),
    };
    let level = fields
        .remove("level")
        .and_then(|level| level.as_str().and_then(|s| LogLevel::from_str(s).ok()))
        .unwrap_or(default_level);
    let payload = if fields.is_empty() {
        Vec::new()
    } else {
        vec![serde_json::Value::Object(fields)]
    };
    Some(ParsedLine {
        level,
        message,
        payload,
    })
}

fn parse_prefixed(line: &str, default_level: LogLevel) -> ParsedLine {
    if let Some((prefix, rest)) = line.split_once(':') {
        if let Ok(level) = LogLevel::from_str(prefix) {
            return ParsedLine {
                level,
                message: rest.trim().to_string(),
                payload: Vec::new(),
            };
        }
    }
    ParsedLine {
        level: default_level,
        message: line.to_string(),
        payload: Vec::new(),
    }
}
