use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire form of one RPC message. Anything else on the channel is not ours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RpcEnvelope {
    #[serde(rename = "rpc-call")]
    Call {
        id: u64,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    #[serde(rename = "rpc-response")]
    Response {
        id: u64,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl RpcEnvelope {
    /// `None` for messages that are not RPC envelopes.
    pub fn from_value(data: &Value) -> Option<Self> {
        serde_json::from_value(data.clone()).ok()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn ok(id: u64, result: Value) -> Self {
        Self::Response {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, message: impl Into<String>) -> Self {
        Self::Response {
            id,
            success: false,
            result: None,
            error: Some(message.into()),
        }
    }
}
