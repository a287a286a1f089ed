//! The Value type - a tree-shaped data structure with callable leaves.
//!
//! This is the data model of a store's local tree. It maps onto JSON-like
//! structured data, with one addition: a leaf may be a [`Callable`], a
//! function invoked when a `get` lands on it (an RPC-style getter). A
//! callable may return its result immediately or as a future.
//!
//! # Design Notes
//!
//! - Uses `BTreeMap` for deterministic ordering (important for hashing,
//!   comparison)
//! - Uses `i64` for integers (sufficient for most use cases, matches many
//!   protocols)
//! - `Callable` leaves compare by identity and serialize as `null`: a
//!   function cannot cross a serialization boundary, so a wire copy of a
//!   tree loses them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::path::Path;

/// A function stored as a leaf in the tree.
///
/// Invoked with the optional `get` parameter; always returns a future.
/// Use [`Value::callable`] for plain functions and [`Value::callable_async`]
/// for ones that need to await.
#[derive(Clone)]
pub struct Callable(Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, Value> + Send + Sync>);

impl Callable {
    /// Wrap a future-returning function.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Option<Value>) -> BoxFuture<'static, Value> + Send + Sync + 'static,
    {
        Callable(Arc::new(f))
    }

    /// Invoke with the supplied parameter.
    pub fn invoke(&self, params: Option<Value>) -> BoxFuture<'static, Value> {
        (self.0)(params)
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable").finish_non_exhaustive()
    }
}

impl PartialEq for Callable {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Outcome of resolving a path against a tree.
#[derive(Debug)]
pub enum Resolved<'a> {
    /// Resolution consumed the whole path and landed on plain data.
    Found(&'a Value),
    /// Resolution encountered a callable; the path holds the unconsumed
    /// suffix (empty when the callable is the final node).
    Callable(&'a Callable, Path),
    /// A segment was missing along the way.
    Absent,
}

/// A tree-shaped value stored at a path.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Value {
    /// Absence of a value. Distinct from "path doesn't exist".
    #[default]
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed 64-bit integer.
    Integer(i64),
    /// 64-bit floating point.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Binary data.
    Bytes(Vec<u8>),
    /// Ordered sequence of values.
    Array(Vec<Value>),
    /// Key-value map with string keys.
    Map(BTreeMap<String, Value>),
    /// A function invoked on `get`.
    Callable(Callable),
}

impl Value {
    /// Create a null value.
    pub fn null() -> Self {
        Value::Null
    }

    /// Create an empty map.
    pub fn map() -> Self {
        Value::Map(BTreeMap::new())
    }

    /// Create an empty array.
    pub fn array() -> Self {
        Value::Array(Vec::new())
    }

    /// Create a callable leaf from a plain function.
    ///
    /// # Example
    ///
    /// ```rust
    /// use entangld::Value;
    ///
    /// let double = Value::callable(|params| match params {
    ///     Some(Value::Integer(n)) => Value::Integer(2 * n),
    ///     _ => Value::Null,
    /// });
    /// assert!(double.is_callable());
    /// ```
    pub fn callable<F>(f: F) -> Self
    where
        F: Fn(Option<Value>) -> Value + Send + Sync + 'static,
    {
        Value::Callable(Callable::new(move |params| {
            let value = f(params);
            Box::pin(async move { value })
        }))
    }

    /// Create a callable leaf from a future-returning function.
    pub fn callable_async<F>(f: F) -> Self
    where
        F: Fn(Option<Value>) -> BoxFuture<'static, Value> + Send + Sync + 'static,
    {
        Value::Callable(Callable::new(f))
    }

    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Check if this value is a map.
    pub fn is_map(&self) -> bool {
        matches!(self, Value::Map(_))
    }

    /// Check if this value is an array.
    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    /// Check if this value is a callable leaf.
    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Callable(_))
    }

    /// Get a reference to a nested value by path.
    ///
    /// Returns `None` if the path doesn't exist or can't be navigated
    /// (e.g., trying to index into a string).
    pub fn get(&self, path: &Path) -> Option<&Value> {
        let mut current = self;
        for segment in path.iter() {
            current = match current {
                Value::Map(map) => map.get(segment)?,
                Value::Array(items) => {
                    let index: usize = segment.parse().ok()?;
                    items.get(index)?
                }
                _ => return None,
            };
        }
        Some(current)
    }

    /// Get a mutable reference to a nested value by path.
    pub fn get_mut(&mut self, path: &Path) -> Option<&mut Value> {
        let mut current = self;
        for segment in path.iter() {
            current = match current {
                Value::Map(map) => map.get_mut(segment)?,
                Value::Array(items) => {
                    let index: usize = segment.parse().ok()?;
                    items.get_mut(index)?
                }
                _ => return None,
            };
        }
        Some(current)
    }

    /// Walk a path, stopping at the first callable encountered.
    ///
    /// Returns the located node, or the callable plus the unconsumed path
    /// suffix, or [`Resolved::Absent`] when a segment is missing.
    pub fn resolve(&self, path: &Path) -> Resolved<'_> {
        let mut current = self;
        for (i, segment) in path.iter().enumerate() {
            if let Value::Callable(callable) = current {
                return Resolved::Callable(callable, path.slice_from(i));
            }
            current = match current {
                Value::Map(map) => match map.get(segment) {
                    Some(v) => v,
                    None => return Resolved::Absent,
                },
                Value::Array(items) => {
                    match segment.parse::<usize>().ok().and_then(|ix| items.get(ix)) {
                        Some(v) => v,
                        None => return Resolved::Absent,
                    }
                }
                _ => return Resolved::Absent,
            };
        }
        match current {
            Value::Callable(callable) => Resolved::Callable(callable, Path::root()),
            other => Resolved::Found(other),
        }
    }

    /// Set a value at a path, creating intermediate maps as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the path traverses through a non-container value
    /// (e.g., trying to set `foo.bar` when `foo` is a string), or if an
    /// array index is malformed or out of bounds.
    pub fn set(&mut self, path: &Path, value: Value) -> Result<(), crate::Error> {
        if path.is_empty() {
            *self = value;
            return Ok(());
        }

        let mut current = self;

        for (i, segment) in path.iter().enumerate() {
            let is_last = i == path.len() - 1;

            if is_last {
                match current {
                    Value::Map(map) => {
                        map.insert(segment.clone(), value);
                        return Ok(());
                    }
                    Value::Array(items) => {
                        let index: usize = segment.parse().map_err(|_| {
                            crate::Error::type_mismatch(format!(
                                "invalid array index: {}",
                                segment
                            ))
                        })?;
                        if index < items.len() {
                            items[index] = value;
                        } else if index == items.len() {
                            items.push(value);
                        } else {
                            return Err(crate::Error::type_mismatch(format!(
                                "array index {} out of bounds",
                                index
                            )));
                        }
                        return Ok(());
                    }
                    _ => {
                        return Err(crate::Error::type_mismatch(format!(
                            "cannot set child '{}' on non-container value",
                            segment
                        )));
                    }
                }
            } else {
                match current {
                    Value::Map(map) => {
                        current = map
                            .entry(segment.clone())
                            .or_insert_with(|| Value::Map(BTreeMap::new()));
                    }
                    Value::Array(items) => {
                        let index: usize = segment.parse().map_err(|_| {
                            crate::Error::type_mismatch(format!(
                                "invalid array index: {}",
                                segment
                            ))
                        })?;
                        current = items.get_mut(index).ok_or_else(|| {
                            crate::Error::type_mismatch(format!(
                                "array index {} out of bounds",
                                index
                            ))
                        })?;
                    }
                    _ => {
                        return Err(crate::Error::type_mismatch(format!(
                            "cannot navigate through non-container at '{}'",
                            segment
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Remove a value at a path, returning it if it existed.
    ///
    /// The terminal segment is deleted from its parent; intermediate maps
    /// stay in place.
    pub fn remove(&mut self, path: &Path) -> Result<Option<Value>, crate::Error> {
        if path.is_empty() {
            let old = std::mem::replace(self, Value::map());
            return Ok(Some(old));
        }

        let parent_path = Path {
            segments: path.segments[..path.len() - 1].to_vec(),
        };
        let last_segment = &path.segments[path.len() - 1];

        let parent = match self.get_mut(&parent_path) {
            Some(p) => p,
            None => return Ok(None),
        };

        match parent {
            Value::Map(map) => Ok(map.remove(last_segment)),
            Value::Array(items) => {
                let index: usize = last_segment.parse().map_err(|_| {
                    crate::Error::type_mismatch(format!("invalid array index: {}", last_segment))
                })?;
                if index < items.len() {
                    Ok(Some(items.remove(index)))
                } else {
                    Ok(None)
                }
            }
            _ => Ok(None),
        }
    }

    /// Depth-limited projection of this value.
    ///
    /// Primitive leaves are kept. At depth 0, a container becomes an empty
    /// container of the same kind; otherwise its children are projected
    /// with depth - 1.
    #[must_use]
    pub fn project(&self, depth: usize) -> Value {
        match self {
            Value::Map(map) => {
                if depth == 0 {
                    Value::map()
                } else {
                    Value::Map(
                        map.iter()
                            .map(|(k, v)| (k.clone(), v.project(depth - 1)))
                            .collect(),
                    )
                }
            }
            Value::Array(items) => {
                if depth == 0 {
                    Value::array()
                } else {
                    Value::Array(items.iter().map(|v| v.project(depth - 1)).collect())
                }
            }
            other => other.clone(),
        }
    }

    /// Replace every callable in this value with the value it produces,
    /// awaiting embedded futures.
    ///
    /// Callables are invoked without a parameter. The result of a callable
    /// is itself dereferenced, so nested callables resolve too.
    pub fn dereferenced(self) -> BoxFuture<'static, Value> {
        Box::pin(async move {
            match self {
                Value::Callable(callable) => {
                    let produced = callable.invoke(None).await;
                    produced.dereferenced().await
                }
                Value::Map(map) => {
                    let mut out = BTreeMap::new();
                    for (key, value) in map {
                        out.insert(key, value.dereferenced().await);
                    }
                    Value::Map(out)
                }
                Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for value in items {
                        out.push(value.dereferenced().await);
                    }
                    Value::Array(out)
                }
                other => other,
            }
        })
    }
}

// Conversion from common types

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Integer(i) => serializer.serialize_i64(*i),
            Value::Float(x) => serializer.serialize_f64(*x),
            Value::String(s) => serializer.serialize_str(s),
            Value::Bytes(b) => serializer.serialize_bytes(b),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(map) => {
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (key, value) in map {
                    out.serialize_entry(key, value)?;
                }
                out.end()
            }
            // Functions cannot cross a serialization boundary.
            Value::Callable(_) => serializer.serialize_unit(),
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a tree-shaped value")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Value, E> {
        Ok(Value::Integer(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Value, E> {
        if v <= i64::MAX as u64 {
            Ok(Value::Integer(v as i64))
        } else {
            Ok(Value::Float(v as f64))
        }
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Value, E> {
        Ok(Value::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Value, E> {
        Ok(Value::String(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Value, E> {
        Ok(Value::String(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Value, E> {
        Ok(Value::Bytes(v.to_vec()))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Value, E> {
        Ok(Value::Bytes(v))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut items = Vec::new();
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Value::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Value, A::Error> {
        let mut map = BTreeMap::new();
        while let Some((key, value)) = access.next_entry::<String, Value>()? {
            map.insert(key, value);
        }
        Ok(Value::Map(map))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}
