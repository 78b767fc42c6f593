//! The envelope document itself: a root object plus positional blobs.

use tracing::debug;

use crate::blob::Blob;
use crate::error::EnvelopeError;
use crate::value::{Object, Value};

/// Declared shape of an envelope's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    /// Structured document with typed keys (plus optional blob children).
    Json,
    /// Raw payload envelope; the document carries bookkeeping only.
    Blob,
}

/// Message envelope: the unit handed to the transport layer.
///
/// Keyed values live in the root [`Object`]; pixel payloads ride as
/// positional blob children, one per image plane, in plane order.
#[derive(Debug)]
pub struct Envelope {
    content_type: ContentType,
    root: Object,
    blobs: Vec<Blob>,
}

impl Envelope {
    pub fn new(content_type: ContentType) -> Self {
        Self {
            content_type,
            root: Object::new(),
            blobs: Vec::new(),
        }
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    /// Bind a root-level key. Fails with [`EnvelopeError::KeyExists`] when
    /// the key is already bound.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<(), EnvelopeError> {
        self.root.put(key, value)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.root.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.root.get_mut(key)
    }

    pub fn remove(&mut self, key: &str) -> Result<Value, EnvelopeError> {
        self.root.remove(key)
    }

    pub fn root(&self) -> &Object {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Object {
        &mut self.root
    }

    /// Append a positional blob child.
    pub fn put_blob(&mut self, blob: Blob) {
        self.blobs.push(blob);
    }

    pub fn blob(&self, index: usize) -> Result<&Blob, EnvelopeError> {
        self.blobs.get(index).ok_or(EnvelopeError::BlobIndex(index))
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }

    /// Detach every blob child, leaving the document in place.
    ///
    /// Used during frame deserialization so the envelope no longer holds a
    /// reference to payload memory it is about to hand over.
    pub fn take_blobs(&mut self) -> Vec<Blob> {
        std::mem::take(&mut self.blobs)
    }

    /// Render the non-blob document as JSON. Blob values nested inside the
    /// document are not representable and render as `null`.
    pub fn to_json(&self) -> serde_json::Value {
        object_to_json(&self.root)
    }

    /// Build a document-only envelope from parsed JSON. Non-object roots
    /// produce an empty document.
    pub fn from_json(value: &serde_json::Value) -> Self {
        let mut env = Envelope::new(ContentType::Json);
        if let serde_json::Value::Object(map) = value {
            for (key, val) in map {
                // Keys in a serde_json map are already unique.
                let _ = env.root.put(key.clone(), json_to_value(val));
            }
        }
        env
    }
}

fn object_to_json(object: &Object) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (key, value) in object.iter() {
        map.insert(key.to_string(), value_to_json(value));
    }
    serde_json::Value::Object(map)
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Int(v) => serde_json::Value::from(*v),
        Value::Float(v) => serde_json::Value::from(*v),
        Value::String(v) => serde_json::Value::from(v.as_str()),
        Value::Bool(v) => serde_json::Value::from(*v),
        Value::Object(obj) => object_to_json(obj),
        Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(value_to_json).collect())
        }
        Value::Blob(blob) => {
            debug!(len = blob.len(), "blob value has no JSON rendering");
            serde_json::Value::Null
        }
        Value::Null => serde_json::Value::Null,
    }
}

fn json_to_value(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(v) => Value::Bool(*v),
        serde_json::Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                Value::Int(v)
            } else {
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(v) => Value::String(v.clone()),
        serde_json::Value::Array(items) => {
            Value::Array(items.iter().map(json_to_value).collect())
        }
        serde_json::Value::Object(map) => {
            let mut obj = Object::new();
            for (key, val) in map {
                let _ = obj.put(key.clone(), json_to_value(val));
            }
            Value::Object(obj)
        }
    }
}
