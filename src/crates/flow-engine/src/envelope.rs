//! Envelopes: the typed payloads that travel across edges.
//!
//! An [`Envelope`] pairs a value with a [`ContentType`] tag and an open
//! metadata map. Nodes never see raw values — only envelopes — so that the
//! resolver can coerce between content types at edge boundaries without the
//! handler needing to know what shape its upstream produced.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

use crate::error::{EngineError, Result};

/// The declared shape of an envelope's body.
///
/// Conversions between these are governed by the coercion matrix in
/// [`coerce`]; not every pair converts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// Plain text.
    RawText,
    /// Structured JSON value (object or array).
    Object,
    /// A conversation-shaped object: `{ messages: [...], context: {...} }`.
    ConversationState,
    /// Opaque bytes; never auto-coerced into or out of other types.
    Binary,
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContentType::RawText => "raw_text",
            ContentType::Object => "object",
            ContentType::ConversationState => "conversation_state",
            ContentType::Binary => "binary",
        };
        f.write_str(s)
    }
}

/// The value carried by an [`Envelope`].
///
/// `Binary` is kept distinct from `Object`/`RawText` so the coercion matrix
/// can refuse to convert it implicitly.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum Body {
    /// A text value.
    Text(String),
    /// A JSON value (object, array, number, bool, null).
    Json(Value),
    /// Opaque byte payload.
    Bytes(Vec<u8>),
}

/// A typed payload produced by a node and carried across edges.
///
/// `meta` is an open map; the engine itself only reads a handful of
/// well-known keys (`execution_time_ms`, `token_usage`, `status`,
/// `iteration`, `branch_id`) but handlers may stash arbitrary values there.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// The payload.
    pub body: Body,
    /// The declared type of `body`.
    pub content_type: ContentType,
    /// Id of the node that produced this envelope.
    pub produced_by: String,
    /// Open metadata map.
    pub meta: HashMap<String, Value>,
}

impl Envelope {
    /// Build a `raw_text` envelope.
    pub fn text(body: impl Into<String>, produced_by: impl Into<String>) -> Self {
        Self {
            body: Body::Text(body.into()),
            content_type: ContentType::RawText,
            produced_by: produced_by.into(),
            meta: HashMap::new(),
        }
    }

    /// Build an `object` envelope.
    pub fn object(body: Value, produced_by: impl Into<String>) -> Self {
        Self {
            body: Body::Json(body),
            content_type: ContentType::Object,
            produced_by: produced_by.into(),
            meta: HashMap::new(),
        }
    }

    /// Build an empty `object` envelope, used for e.g. max-iteration markers.
    pub fn empty(produced_by: impl Into<String>) -> Self {
        Self::object(Value::Object(Default::default()), produced_by)
    }

    /// Insert a metadata value, returning `self` for chaining.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Read the `iteration` meta field, if present.
    pub fn iteration(&self) -> Option<i64> {
        self.meta.get("iteration").and_then(Value::as_i64)
    }

    /// Read the `branch_id` meta field, if present.
    pub fn branch_id(&self) -> Option<&str> {
        self.meta.get("branch_id").and_then(Value::as_str)
    }

    /// Render the body as a JSON [`Value`], regardless of content type.
    pub fn as_json(&self) -> Value {
        match &self.body {
            Body::Text(s) => Value::String(s.clone()),
            Body::Json(v) => v.clone(),
            Body::Bytes(b) => Value::String(format!("<{} bytes>", b.len())),
        }
    }

    /// Render the body as a plain string, regardless of content type.
    pub fn as_text(&self) -> String {
        match &self.body {
            Body::Text(s) => s.clone(),
            Body::Json(v) => {
                serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string())
            }
            Body::Bytes(b) => format!("<{} bytes>", b.len()),
        }
    }
}

/// Coerce an envelope to the content type an edge declares.
///
/// Follows the matrix: same-type is identity; `raw_text -> object` attempts
/// a JSON parse and falls back to `{"text": body}` on failure; anything
/// touching `binary` on either side fails unless both sides already agree.
/// In loose mode (`strict = false`) a failing cell returns the original body
/// re-tagged with the target type instead of erroring.
pub fn coerce(envelope: &Envelope, target: ContentType, node: &str, strict: bool) -> Result<Envelope> {
    if envelope.content_type == target {
        return Ok(envelope.clone());
    }

    let coerced_body = match (&envelope.content_type, target) {
        (ContentType::RawText, ContentType::Object) => match &envelope.body {
            Body::Text(s) => match serde_json::from_str::<Value>(s) {
                Ok(v) => Some(Body::Json(v)),
                Err(_) => Some(Body::Json(serde_json::json!({ "text": s }))),
            },
            other => Some(other.clone()),
        },
        (ContentType::RawText, ContentType::ConversationState) => {
            let text = envelope.as_text();
            Some(Body::Json(serde_json::json!({
                "messages": [{ "role": "assistant", "content": text }],
                "context": {},
            })))
        }
        (ContentType::Object, ContentType::RawText) => Some(Body::Text(envelope.as_text())),
        (ContentType::Object, ContentType::ConversationState) => match &envelope.body {
            Body::Json(Value::Object(_)) => Some(envelope.body.clone()),
            _ => None,
        },
        (ContentType::ConversationState, ContentType::RawText) => Some(Body::Text(envelope.as_text())),
        (ContentType::ConversationState, ContentType::Object) => Some(envelope.body.clone()),
        _ => None,
    };

    match coerced_body {
        Some(body) => Ok(Envelope {
            body,
            content_type: target,
            produced_by: envelope.produced_by.clone(),
            meta: envelope.meta.clone(),
        }),
        None if strict => Err(EngineError::Transformation {
            node: node.to_string(),
            from: envelope.content_type,
            to: target,
        }),
        None => {
            tracing::warn!(
                node,
                from = %envelope.content_type,
                to = %target,
                "loose coercion: passing envelope through unchanged"
            );
            Ok(Envelope {
                content_type: target,
                ..envelope.clone()
            })
        }
    }
}

/// A single data-transformation rule applied to an edge's payload before
/// coercion. Unknown rules (and malformed field references) are no-ops.
#[derive(Debug, Clone)]
pub enum TransformRule {
    /// Pull a single field out of an object body.
    Extract { field: String },
    /// Wrap the whole body under a key.
    Wrap { key: String },
    /// Rename object keys per an explicit mapping.
    Map { mapping: HashMap<String, String> },
    /// Render a `{placeholder}`-style template against the body (object
    /// bodies only; other bodies pass through unchanged).
    Template { template: String },
    /// Parse a raw-text body as JSON.
    ParseJson,
}

/// Apply an ordered list of [`TransformRule`]s to a value.
///
/// Transforms operate on the JSON projection of the envelope body; the
/// result is re-wrapped as `Body::Json` unless the only rule applied was
/// `ParseJson` on already-text input, in which case the caller re-derives
/// content type via [`coerce`].
pub fn apply_rules(body: Value, rules: &[TransformRule]) -> Value {
    rules.iter().fold(body, |acc, rule| apply_rule(acc, rule))
}

fn apply_rule(body: Value, rule: &TransformRule) -> Value {
    match rule {
        TransformRule::Extract { field } => body
            .as_object()
            .and_then(|o| o.get(field.as_str()))
            .cloned()
            .unwrap_or(Value::Null),
        TransformRule::Wrap { key } => serde_json::json!({ key.clone(): body }),
        TransformRule::Map { mapping } => match body.as_object() {
            Some(obj) => {
                let mut out = serde_json::Map::new();
                for (k, v) in obj {
                    let new_key = mapping.get(k).cloned().unwrap_or_else(|| k.clone());
                    out.insert(new_key, v.clone());
                }
                Value::Object(out)
            }
            None => body,
        },
        TransformRule::Template { template } => match body.as_object() {
            Some(obj) => {
                let mut rendered = template.clone();
                for (k, v) in obj {
                    let placeholder = format!("{{{}}}", k);
                    let value_str = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    rendered = rendered.replace(&placeholder, &value_str);
                }
                Value::String(rendered)
            }
            None => body,
        },
        TransformRule::ParseJson => match &body {
            Value::String(s) => serde_json::from_str(s).unwrap_or(body),
            _ => body,
        },
    }
}
