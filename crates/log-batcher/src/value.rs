// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Payload values attached to log records.
//!
//! Objects and arrays are shared nodes (`Arc<RwLock<..>>`), so payloads can
//! form arbitrary graphs, including graphs that reference themselves:
//!
//! ```
//! use log_batcher::value::Value;
//!
//! let request = Value::object();
//! request.insert("path", "/checkout");
//! request.insert("self", request.clone());
//! ```
//!
//! Converting such a graph to JSON is the job of
//! [`crate::formatter::CycleSafeFormatter`].

use std::error::Error as StdError;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Shared, mutable object node. Key order is insertion order.
pub type ObjectNode = Arc<RwLock<Vec<(String, Value)>>>;

/// Shared, mutable array node.
pub type ArrayNode = Arc<RwLock<Vec<Value>>>;

#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Array(ArrayNode),
    Object(ObjectNode),
    Error(ErrorValue),
    /// Already serialized; passed through untouched.
    Json(serde_json::Value),
}

impl Value {
    /// New empty object node.
    #[must_use]
    pub fn object() -> Self {
        Value::Object(Arc::new(RwLock::new(Vec::new())))
    }

    /// New empty array node.
    #[must_use]
    pub fn array() -> Self {
        Value::Array(Arc::new(RwLock::new(Vec::new())))
    }

    pub fn object_from<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let entries = entries.into_iter().map(|(k, v)| (k.into(), v)).collect();
        Value::Object(Arc::new(RwLock::new(entries)))
    }

    pub fn array_from<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        Value::Array(Arc::new(RwLock::new(items.into_iter().collect())))
    }

    /// Captures an error's message and its source chain.
    pub fn error<E: StdError + ?Sized>(err: &E) -> Self {
        Value::Error(ErrorValue::from_error(err))
    }

    /// Sets `key` on an object node, replacing an existing entry.
    ///
    /// Returns `false` if `self` is not an object or its lock is poisoned.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) -> bool {
        let Value::Object(node) = self else {
            return false;
        };
        let Ok(mut entries) = node.write() else {
            return false;
        };
        let key = key.into();
        let value = value.into();
        match entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => entries.push((key, value)),
        }
        true
    }

    /// Appends to an array node. Returns `false` if `self` is not an array.
    pub fn push(&self, value: impl Into<Value>) -> bool {
        let Value::Array(node) = self else {
            return false;
        };
        let Ok(mut items) = node.write() else {
            return false;
        };
        items.push(value.into());
        true
    }

    /// Identity of a composite node; `None` for scalars.
    #[must_use]
    pub fn node_id(&self) -> Option<usize> {
        match self {
            Value::Array(node) => Some(Arc::as_ptr(node) as *const () as usize),
            Value::Object(node) => Some(Arc::as_ptr(node) as *const () as usize),
            _ => None,
        }
    }
}

// Composite nodes may be cyclic, so Debug never descends into them.
impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(i) => write!(f, "Int({i})"),
            Value::UInt(u) => write!(f, "UInt({u})"),
            Value::Float(x) => write!(f, "Float({x})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::Array(node) => write!(f, "Array({:p})", Arc::as_ptr(node)),
            Value::Object(node) => write!(f, "Object({:p})", Arc::as_ptr(node)),
            Value::Error(e) => write!(f, "Error({e:?})"),
            Value::Json(j) => write!(f, "Json({j})"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<u64> for Value {
    fn from(u: u64) -> Self {
        Value::UInt(u)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<serde_json::Value> for Value {
    fn from(j: serde_json::Value) -> Self {
        Value::Json(j)
    }
}

impl From<ErrorValue> for Value {
    fn from(e: ErrorValue) -> Self {
        Value::Error(e)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// An error captured into a payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorValue {
    pub name: String,
    pub message: String,
    /// Trace text; for Rust errors this is the `source()` chain.
    pub stack: Option<String>,
}

impl ErrorValue {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    #[must_use]
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn from_error<E: StdError + ?Sized>(err: &E) -> Self {
        let name = short_type_name(std::any::type_name::<E>());
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(format!("caused by: {cause}"));
            source = cause.source();
        }
        Self {
            name,
            message: err.to_string(),
            stack: (!chain.is_empty()).then(|| chain.join("\n")),
        }
    }
}

fn short_type_name(full: &str) -> String {
    // Trait objects carry no concrete name.
    if full.starts_with("dyn ") {
        return "Error".to_string();
    }
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}
