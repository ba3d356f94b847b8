//! Frames: one entry of a strand's call stack.
//!
//! A frame is a JSON object at the storage boundary. A handful of keys are
//! reserved for the engine (subject, retval, back-links, pending calls,
//! deadlines); everything else belongs to the Prog, which decodes it into its
//! own strongly typed struct via [Frame::decode] as soon as a step starts.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::kernel::error::KernelError;
use crate::kernel::identity::StrandId;

pub const SUBJECT_ID: &str = "subject_id";
pub const RETVAL: &str = "retval";
pub const LINK: &str = "link";
pub const PENDING_CALL: &str = "pending_call";
pub const DEADLINE_TARGET: &str = "deadline_target";
pub const DEADLINE_AT: &str = "deadline_at";
pub const DEADLINE_ALLOW_EXTENSION: &str = "deadline_allow_extension";

const RESERVED: &[&str] = &[
    SUBJECT_ID,
    RETVAL,
    LINK,
    PENDING_CALL,
    DEADLINE_TARGET,
    DEADLINE_AT,
    DEADLINE_ALLOW_EXTENSION,
];

/// Back-link of an in-strand call frame: where `pop` returns to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub prog: String,
    pub label: String,
}

/// Marker left in the caller's frame while a pushed child strand runs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCall {
    pub child_id: StrandId,
    pub return_label: String,
}

/// One call-stack entry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Frame(Map<String, Value>);

impl Frame {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn for_subject(subject_id: StrandId) -> Self {
        let mut frame = Self::new();
        frame.set_subject_id(subject_id);
        frame
    }

    /// Accepts only JSON objects.
    pub fn from_value(value: Value) -> Result<Self, KernelError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(KernelError::Frame(format!(
                "frame must be a JSON object, got {other}"
            ))),
        }
    }

    /// Serializes Prog-specific data into a frame.
    pub fn encode<T: Serialize>(data: &T) -> Result<Self, KernelError> {
        let value =
            serde_json::to_value(data).map_err(|e| KernelError::Frame(format!("encode: {e}")))?;
        Self::from_value(value)
    }

    /// Decodes the frame into a Prog's typed view. Reserved keys are ignored
    /// unless the target type names them.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, KernelError> {
        serde_json::from_value(Value::Object(self.0.clone()))
            .map_err(|e| KernelError::Frame(format!("decode: {e}")))
    }

    /// Copies the non-reserved fields of `data` into this frame.
    pub fn store<T: Serialize>(&mut self, data: &T) -> Result<(), KernelError> {
        let encoded = Self::encode(data)?;
        for (key, value) in encoded.0 {
            if !RESERVED.contains(&key.as_str()) {
                self.0.insert(key, value);
            }
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Overwrites keys of `self` with those of `updates`.
    pub fn merge(&mut self, updates: Frame) {
        for (key, value) in updates.0 {
            self.0.insert(key, value);
        }
    }

    pub fn subject_id(&self) -> Option<StrandId> {
        self.0
            .get(SUBJECT_ID)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }

    pub fn set_subject_id(&mut self, subject_id: StrandId) {
        self.0
            .insert(SUBJECT_ID.to_string(), Value::String(subject_id.to_string()));
    }

    pub fn retval(&self) -> Option<&Value> {
        self.0.get(RETVAL).filter(|v| !v.is_null())
    }

    pub fn set_retval(&mut self, value: Value) {
        self.0.insert(RETVAL.to_string(), value);
    }

    pub fn clear_retval(&mut self) {
        self.0.remove(RETVAL);
    }

    pub fn link(&self) -> Result<Option<Link>, KernelError> {
        self.typed(LINK)
    }

    pub fn set_link(&mut self, link: &Link) -> Result<(), KernelError> {
        self.set_typed(LINK, link)
    }

    pub fn pending_call(&self) -> Result<Option<PendingCall>, KernelError> {
        self.typed(PENDING_CALL)
    }

    pub fn set_pending_call(&mut self, call: &PendingCall) -> Result<(), KernelError> {
        self.set_typed(PENDING_CALL, call)
    }

    pub fn clear_pending_call(&mut self) {
        self.0.remove(PENDING_CALL);
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub(crate) fn typed<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, KernelError> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| KernelError::Frame(format!("malformed {key}: {e}"))),
        }
    }

    pub(crate) fn set_typed<T: Serialize>(&mut self, key: &str, data: &T) -> Result<(), KernelError> {
        let value = serde_json::to_value(data)
            .map_err(|e| KernelError::Frame(format!("encode {key}: {e}")))?;
        self.0.insert(key.to_string(), value);
        Ok(())
    }
}
