// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cycle-safe conversion of payload graphs to JSON.
//!
//! Payload objects and arrays are shared nodes, so a payload may contain a
//! reference back to itself or to one of its ancestors. The formatter walks
//! the graph with an explicit work stack and a set of node identities that
//! are currently being visited:
//!
//! ```text
//!   enter(node)
//!     ├─ id in seen?  ──yes──> "[Circular]"
//!     └─ no: seen += id, visit children, seen -= id
//! ```
//!
//! # Seen Set Lifetime
//!
//! A fresh set is created for every top-level [`CycleSafeFormatter::format`]
//! call and dropped when the call returns. Nothing is remembered between
//! calls, so formatting the same acyclic object twice never reports a cycle.
//!
//! Because identities are removed when the walk leaves a node, only true
//! back-references are marked. A node reachable through two siblings (a
//! diamond) is rendered in full both times.
//!
//! # Degradation
//!
//! Formatting never fails:
//! - Non-finite floats become `"[Unserializable: NaN]"` style text
//! - A node whose lock is poisoned becomes `"[Unreadable]"`
//!
//! The walk is iterative, so nesting depth is bounded by memory rather than
//! by the thread's stack.

use std::collections::HashSet;

use serde_json::{Map, Number, Value as JsonValue};
use tracing::warn;

use crate::constants::{CYCLE_MARKER, UNREADABLE_MARKER};
use crate::value::{ErrorValue, Value};

/// Converts [`Value`] graphs to `serde_json::Value`.
///
/// # Example
///
/// ```
/// use log_batcher::formatter::CycleSafeFormatter;
/// use log_batcher::value::Value;
///
/// let node = Value::object();
/// node.insert("name", "loop");
/// node.insert("me", node.clone());
///
/// let json = CycleSafeFormatter.format(&node);
/// assert_eq!(json["name"], "loop");
/// assert_eq!(json["me"], "[Circular]");
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct CycleSafeFormatter;

/// A composite node being visited.
enum Frame {
    Array {
        id: usize,
        items: std::vec::IntoIter<Value>,
        out: Vec<JsonValue>,
    },
    Object {
        id: usize,
        entries: std::vec::IntoIter<(String, Value)>,
        pending_key: Option<String>,
        out: Map<String, JsonValue>,
    },
}

impl Frame {
    fn id(&self) -> usize {
        match self {
            Frame::Array { id, .. } | Frame::Object { id, .. } => *id,
        }
    }

    fn next_child(&mut self) -> Option<Value> {
        match self {
            Frame::Array { items, .. } => items.next(),
            Frame::Object {
                entries,
                pending_key,
                ..
            } => {
                let (key, value) = entries.next()?;
                *pending_key = Some(key);
                Some(value)
            }
        }
    }

    fn accept(&mut self, json: JsonValue) {
        match self {
            Frame::Array { out, .. } => out.push(json),
            Frame::Object {
                pending_key, out, ..
            } => {
                out.insert(pending_key.take().unwrap_or_default(), json);
            }
        }
    }

    fn finish(self) -> JsonValue {
        match self {
            Frame::Array { out, .. } => JsonValue::Array(out),
            Frame::Object { out, .. } => JsonValue::Object(out),
        }
    }
}

impl CycleSafeFormatter {
    /// Formats one value. Terminates on every input.
    pub fn format(&self, value: &Value) -> JsonValue {
        let mut seen: HashSet<usize> = HashSet::new();
        let mut stack: Vec<Frame> = Vec::new();
        let mut finished = Self::enter(value, &mut seen, &mut stack);

        loop {
            if let Some(json) = finished.take() {
                match stack.last_mut() {
                    Some(parent) => parent.accept(json),
                    None => return json,
                }
            }

            let next = match stack.last_mut() {
                Some(frame) => frame.next_child(),
                None => return JsonValue::Null,
            };

            finished = match next {
                Some(child) => Self::enter(&child, &mut seen, &mut stack),
                None => stack.pop().map(|frame| {
                    seen.remove(&frame.id());
                    frame.finish()
                }),
            };
        }
    }

    /// Formats each value of a record payload with its own seen set.
    pub fn format_all(&self, values: &[Value]) -> Vec<JsonValue> {
        values.iter().map(|value| self.format(value)).collect()
    }

    /// Returns the JSON for a leaf, or pushes a frame and returns `None`.
    fn enter(value: &Value, seen: &mut HashSet<usize>, stack: &mut Vec<Frame>) -> Option<JsonValue> {
        match value {
            Value::Null => Some(JsonValue::Null),
            Value::Bool(b) => Some(JsonValue::Bool(*b)),
            Value::Int(i) => Some(JsonValue::Number(Number::from(*i))),
            Value::UInt(u) => Some(JsonValue::Number(Number::from(*u))),
            Value::Float(x) => Some(float_to_json(*x)),
            Value::String(s) => Some(JsonValue::String(s.clone())),
            Value::Json(json) => Some(json.clone()),
            Value::Error(err) => Some(error_to_json(err)),
            Value::Array(node) => {
                let id = value.node_id().unwrap_or_default();
                if seen.contains(&id) {
                    return Some(JsonValue::String(CYCLE_MARKER.to_string()));
                }
                // Snapshot children so no lock is held during the walk.
                let Ok(items) = node.read().map(|items| items.clone()) else {
                    warn!("LOGS | Payload array lock poisoned, emitting placeholder");
                    return Some(JsonValue::String(UNREADABLE_MARKER.to_string()));
                };
                seen.insert(id);
                stack.push(Frame::Array {
                    id,
                    out: Vec::with_capacity(items.len()),
                    items: items.into_iter(),
                });
                None
            }
            Value::Object(node) => {
                let id = value.node_id().unwrap_or_default();
                if seen.contains(&id) {
                    return Some(JsonValue::String(CYCLE_MARKER.to_string()));
                }
                let Ok(entries) = node.read().map(|entries| entries.clone()) else {
                    warn!("LOGS | Payload object lock poisoned, emitting placeholder");
                    return Some(JsonValue::String(UNREADABLE_MARKER.to_string()));
                };
                seen.insert(id);
                stack.push(Frame::Object {
                    id,
                    entries: entries.into_iter(),
                    pending_key: None,
                    out: Map::new(),
                });
                None
            }
        }
    }
}

fn float_to_json(x: f64) -> JsonValue {
    Number::from_f64(x)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(format!("[Unserializable: {x}]")))
}

fn error_to_json(err: &ErrorValue) -> JsonValue {
    let mut out = Map::new();
    out.insert("name".to_string(), JsonValue::String(err.name.clone()));
    out.insert("message".to_string(), JsonValue::String(err.message.clone()));
    if let Some(stack) = &err.stack {
        out.insert("stack".to_string(), JsonValue::String(stack.clone()));
    }
    JsonValue::Object(out)
}
