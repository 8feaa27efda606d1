use serde::de;
use serde_json::error::Category;
use serde_json::Value;
use thiserror::Error;

use crate::types::{Handshake, Task, TestResult};

/// Wire protocol semantics: JSON text frames in both directions.
/// Keeps the worker and any dispatcher-side tooling from drifting apart.

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message is not valid JSON: {0}")]
    MalformedJson(#[source] serde_json::Error),

    #[error("message is not a valid task: {0}")]
    InvalidTask(#[source] serde_json::Error),

    #[error("failed to encode outbound message: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Decode one inbound task message
///
/// Only a JSON object is a task; serde would otherwise also accept a
/// positional array for the struct.
pub fn decode_task(raw: &str) -> Result<Task, ProtocolError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| match e.classify() {
        Category::Syntax | Category::Eof | Category::Io => ProtocolError::MalformedJson(e),
        Category::Data => ProtocolError::InvalidTask(e),
    })?;
    if !value.is_object() {
        return Err(ProtocolError::InvalidTask(de::Error::custom(
            "expected a JSON object",
        )));
    }
    serde_json::from_value(value).map_err(ProtocolError::InvalidTask)
}

pub fn encode_result(result: &TestResult) -> Result<String, ProtocolError> {
    serde_json::to_string(result).map_err(ProtocolError::Encode)
}

pub fn encode_handshake(handshake: &Handshake) -> Result<String, ProtocolError> {
    serde_json::to_string(handshake).map_err(ProtocolError::Encode)
}
