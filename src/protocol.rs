use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;

#[derive(Debug, Deserialize)]
pub struct Request {
	#[serde(default)]
	pub jsonrpc: Option<String>,
	/// Absent for notifications, which never get a response.
	#[serde(default)]
	pub id: Option<Value>,
	pub method: String,
	#[serde(default)]
	pub params: Value,
}

impl Request {
	pub fn is_notification(&self) -> bool {
		self.id.is_none()
	}
}

#[derive(Debug, Serialize)]
pub struct Response {
	pub jsonrpc: &'static str,
	pub id: Value,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub result: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<ErrorObject>,
}

#[derive(Debug, Serialize)]
pub struct ErrorObject {
	pub code: i64,
	pub message: String,
}

impl Response {
	pub fn ok(id: Value, result: Value) -> Self {
		Self {
			jsonrpc: "2.0",
			id,
			result: Some(result),
			error: None
		}
	}
	pub fn err(id: Value, code: i64, message: impl Into<String>) -> Self {
		Self {
			jsonrpc: "2.0",
			id,
			result: None,
			error: Some(ErrorObject {
				code,
				message: message.into()
			})
		}
	}
}

/// Cancellation-registry key for a request id; numbers and strings never collide.
pub fn id_key(id: &Value) -> String {
	match id {
		Value::String(text) => format!("s:{}", text),
		other => format!("n:{}", other),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn notifications_have_no_id() {
		let req: Request = serde_json::from_value(json!({
			"jsonrpc": "2.0",
			"method": "notifications/cancelled",
			"params": { "requestId": 4 }
		})).expect("parse");
		assert!(req.is_notification());
		let req: Request = serde_json::from_value(json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" })).expect("parse");
		assert!(!req.is_notification());
		assert!(req.params.is_null());
	}

	#[test]
	fn responses_omit_the_unused_half() {
		let ok = serde_json::to_value(Response::ok(json!(1), json!({}))).expect("ok");
		assert_eq!(ok["jsonrpc"], "2.0");
		assert!(ok.get("error").is_none());
		let err = serde_json::to_value(Response::err(Value::Null, PARSE_ERROR, "bad json")).expect("err");
		assert_eq!(err["error"]["code"], -32700);
		assert!(err.get("result").is_none());
	}

	#[test]
	fn id_keys_distinguish_types() {
		assert_ne!(id_key(&json!(1)), id_key(&json!("1")));
		assert_eq!(id_key(&json!(7)), id_key(&json!(7)));
	}
}
