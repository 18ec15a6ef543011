//! Task payloads handed to execution units.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use lakepurge_core::{ExecutionId, JobId};

use crate::work_queue::{ReceiptHandle, WorkQueueMessage};

pub const JOB_ID_FIELD: &str = "JobId";
pub const EXECUTION_ID_FIELD: &str = "ExecutionId";
pub const RECEIPT_HANDLE_FIELD: &str = "ReceiptHandle";
pub const FINGERPRINT_FIELD: &str = "TaskFingerprint";

/// Namespace for task fingerprints (UUIDv5 over the raw message body).
const FINGERPRINT_NAMESPACE: Uuid = Uuid::from_u128(0x6c61_6b65_7075_7267_6500_7461_736b_0001);

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("message body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message body must be a JSON object, got {0}")]
    NotAnObject(&'static str),
}

/// A message body plus the correlation fields an execution unit needs to
/// report back and acknowledge its delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskPayload(Map<String, Value>);

impl TaskPayload {
    /// Parse a delivered message and enrich it for launch.
    ///
    /// Enrichment fields overwrite same-named keys in the body.
    pub fn from_message(
        message: &WorkQueueMessage,
        job_id: JobId,
        execution_id: &ExecutionId,
    ) -> Result<Self, PayloadError> {
        let mut fields = match serde_json::from_str::<Value>(&message.body)? {
            Value::Object(map) => map,
            other => return Err(PayloadError::NotAnObject(json_kind(&other))),
        };

        fields.insert(JOB_ID_FIELD.to_string(), Value::String(job_id.to_string()));
        fields.insert(EXECUTION_ID_FIELD.to_string(), Value::String(execution_id.to_string()));
        fields.insert(
            RECEIPT_HANDLE_FIELD.to_string(),
            Value::String(message.receipt_handle.to_string()),
        );
        fields.insert(
            FINGERPRINT_FIELD.to_string(),
            Value::String(fingerprint(&message.body).to_string()),
        );
        Ok(Self(fields))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn receipt_handle(&self) -> Option<ReceiptHandle> {
        self.str_field(RECEIPT_HANDLE_FIELD).map(ReceiptHandle::new)
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.str_field(FINGERPRINT_FIELD)
    }

    pub fn job_id(&self) -> Option<&str> {
        self.str_field(JOB_ID_FIELD)
    }

    pub fn to_json_string(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }
}

/// Stable identity of a task body across redeliveries.
pub fn fingerprint(body: &str) -> Uuid {
    Uuid::new_v5(&FINGERPRINT_NAMESPACE, body.as_bytes())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
