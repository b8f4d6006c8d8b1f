use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// Value types callers may supply as operation parameters.
///
/// The operations only ever read strings, but booleans and explicit nulls are
/// accepted so callers can forward upstream payloads without re-encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Str(String),
    Bool(bool),
    Null,
}

impl ParamValue {
    /// Returns the string payload, if this value carries one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(value) => Some(value.as_str()),
            _ => None,
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Str(value.to_owned())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Str(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

/// Caller-supplied input for a single remediation operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Tenant the operation is authorized under. Must be non-empty.
    pub tenant_id: String,
    /// Named parameters; keys are case-sensitive.
    #[serde(default)]
    pub parameters: BTreeMap<String, ParamValue>,
}

impl RequestEnvelope {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            parameters: BTreeMap::new(),
        }
    }

    /// Attach a named parameter, consuming and returning the envelope.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn param(&self, key: &str) -> Option<&ParamValue> {
        self.parameters.get(key)
    }

    /// Returns the parameter as a string slice, if present and string-typed.
    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.param(key).and_then(ParamValue::as_str)
    }
}

/// Required keys absent from the request, in the order they were asked for.
pub fn missing_params(request: &RequestEnvelope, required: &[&str]) -> Vec<String> {
    required
        .iter()
        .filter(|key| !request.parameters.contains_key(**key))
        .map(|key| (*key).to_owned())
        .collect()
}

/// Uniform outcome wrapper returned by every remediation operation.
///
/// Created fresh per call and never mutated after being returned. Callers
/// distinguish success via the `success` flag; operations never raise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub success: bool,
    pub message: String,
    pub data: BTreeMap<String, Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub elapsed: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Captures operation entry time and stamps envelopes on the way out.
#[derive(Debug, Clone)]
pub struct OperationTimer {
    started_at: OffsetDateTime,
    begun: Instant,
}

impl OperationTimer {
    pub fn start() -> Self {
        Self {
            started_at: OffsetDateTime::now_utc(),
            begun: Instant::now(),
        }
    }

    pub fn succeeded(
        &self,
        message: impl Into<String>,
        data: BTreeMap<String, Value>,
    ) -> ResponseEnvelope {
        ResponseEnvelope {
            success: true,
            message: message.into(),
            data,
            started_at: self.started_at,
            elapsed: self.begun.elapsed(),
            error: None,
        }
    }

    pub fn failed(&self, message: impl Into<String>, error: impl Into<String>) -> ResponseEnvelope {
        ResponseEnvelope {
            success: false,
            message: message.into(),
            data: BTreeMap::new(),
            started_at: self.started_at,
            elapsed: self.begun.elapsed(),
            error: Some(error.into()),
        }
    }
}
