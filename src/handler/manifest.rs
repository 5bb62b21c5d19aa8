//! Call kinds and the muxrpc manifest.
//!
//! A manifest maps dotted method names to call kinds. On the wire it is
//! nested JSON, one object level per name segment:
//!
//! ```text
//! {"hello": "async", "stuff": "source", "blobs": {"get": "source"}}
//! ```
//!
//! # Example
//!
//! ```
//! use muxrpc::{CallKind, Manifest};
//!
//! let manifest = Manifest::from_json(&serde_json::json!({
//!     "hello": "async",
//!     "blobs": {"get": "source"}
//! }))
//! .unwrap();
//!
//! assert_eq!(manifest.get("blobs.get"), Some(CallKind::Source));
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{MuxrpcError, Result};

/// Interaction pattern of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    /// One request, one reply.
    Async,
    /// One request, a stream of replies.
    Source,
    /// One request followed by a stream from the caller.
    Sink,
    /// Streams in both directions.
    Duplex,
}

impl CallKind {
    /// Wire name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Async => "async",
            Self::Source => "source",
            Self::Sink => "sink",
            Self::Duplex => "duplex",
        }
    }

    /// True for every kind carried in stream frames.
    #[inline]
    pub fn is_stream(self) -> bool {
        !matches!(self, Self::Async)
    }

    /// True if the callee sends values back in stream frames.
    #[inline]
    pub(crate) fn callee_streams(self) -> bool {
        matches!(self, Self::Source | Self::Duplex)
    }

    /// True if the caller sends values after the request.
    #[inline]
    pub(crate) fn caller_streams(self) -> bool {
        matches!(self, Self::Sink | Self::Duplex)
    }
}

impl FromStr for CallKind {
    type Err = MuxrpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            // Older Go peers send "JSON" for async calls
            "async" | "sync" | "JSON" => Ok(Self::Async),
            "source" => Ok(Self::Source),
            "sink" => Ok(Self::Sink),
            "duplex" => Ok(Self::Duplex),
            other => Err(MuxrpcError::protocol(format!(
                "Unsupported call kind: {other:?}"
            ))),
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flat view of a manifest: dotted name to kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    methods: BTreeMap<String, CallKind>,
}

impl Manifest {
    /// Create an empty manifest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a method.
    pub fn insert(&mut self, name: &str, kind: CallKind) {
        self.methods.insert(name.to_string(), kind);
    }

    /// Kind of a method.
    pub fn get(&self, name: &str) -> Option<CallKind> {
        self.methods.get(name).copied()
    }

    /// Number of methods.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// True if no methods are listed.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Iterate methods in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, CallKind)> {
        self.methods.iter().map(|(name, kind)| (name.as_str(), *kind))
    }

    /// Parse nested manifest JSON.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for a leaf that is not a known kind.
    pub fn from_json(value: &Value) -> Result<Self> {
        let mut manifest = Self::new();
        let Value::Object(root) = value else {
            return Err(MuxrpcError::protocol("Manifest must be a JSON object"));
        };
        flatten(root, "", &mut manifest)?;
        Ok(manifest)
    }

    /// Render as nested manifest JSON.
    pub fn to_json(&self) -> Value {
        let mut root = Map::new();
        for (name, kind) in &self.methods {
            let segments: Vec<&str> = name.split('.').collect();
            insert_path(&mut root, &segments, *kind);
        }
        Value::Object(root)
    }
}

fn insert_path(node: &mut Map<String, Value>, segments: &[&str], kind: CallKind) {
    match segments {
        [] => {}
        [leaf] => {
            node.insert(leaf.to_string(), Value::String(kind.as_str().to_string()));
        }
        [head, rest @ ..] => {
            let child = node
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(map) = child {
                insert_path(map, rest, kind);
            }
        }
    }
}

fn flatten(node: &Map<String, Value>, prefix: &str, out: &mut Manifest) -> Result<()> {
    for (key, value) in node {
        let name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::String(kind) => out.insert(&name, kind.parse()?),
            Value::Object(child) => flatten(child, &name, out)?,
            other => {
                return Err(MuxrpcError::protocol(format!(
                    "Manifest entry {name} is not a kind: {other}"
                )))
            }
        }
    }
    Ok(())
}

impl FromIterator<(String, CallKind)> for Manifest {
    fn from_iter<I: IntoIterator<Item = (String, CallKind)>>(iter: I) -> Self {
        Self {
            methods: iter.into_iter().collect(),
        }
    }
}
