//! Wire framing for the rippled websocket API.
//!
//! Requests are JSON objects carrying a numeric `id`, the `command` name and
//! the command parameters at the top level. Incoming frames are either
//! responses correlated by `id` or push events discriminated by `type`.

use crate::{ChannelError, ChannelEvent};
use serde_json::{Map, Value};
use watcher_types::{EngineResult, LedgerClosedEvent, TransactionEvent};

/// Error code rippled uses when it is not synced to the network.
const NOT_SYNCED_CODE: &str = "noNetwork";

/// A decoded incoming frame.
#[derive(Debug, PartialEq)]
pub enum Incoming {
	/// Reply to the request with the given id.
	Response {
		id: u64,
		reply: Result<Value, ChannelError>,
	},
	/// A push event to forward to subscribers.
	Event(ChannelEvent),
	/// A transaction that did not succeed, while only successful ones are forwarded.
	FilteredTransaction,
	/// A frame of a type the watcher does not handle.
	Unhandled(String),
}

/// Builds a request frame.
pub fn encode_request(id: u64, command: &str, params: Value) -> Result<String, ChannelError> {
	let mut frame = match params {
		Value::Object(map) => map,
		Value::Null => Map::new(),
		other => {
			return Err(ChannelError::Protocol(format!(
				"request parameters must be an object, got {}",
				other
			)))
		},
	};
	frame.insert("id".to_string(), Value::from(id));
	frame.insert("command".to_string(), Value::from(command));

	serde_json::to_string(&Value::Object(frame)).map_err(|e| ChannelError::Protocol(e.to_string()))
}

/// Decodes an incoming frame.
///
/// When `forward_all_transactions` is false, transaction events whose
/// preliminary engine result is not `tesSUCCESS` are filtered out.
pub fn decode_frame(text: &str, forward_all_transactions: bool) -> Result<Incoming, ChannelError> {
	let data: Value = serde_json::from_str(text)
		.map_err(|e| ChannelError::Protocol(format!("invalid JSON frame: {}", e)))?;

	let kind = data.get("type").and_then(Value::as_str).unwrap_or_default();

	if let Some(id) = data.get("id").and_then(Value::as_u64) {
		return Ok(Incoming::Response {
			id,
			reply: decode_reply(&data, kind),
		});
	}

	match kind {
		"response" => Ok(Incoming::Unhandled("response without id".to_string())),
		"transaction" => {
			let event: TransactionEvent = serde_json::from_value(data)
				.map_err(|e| ChannelError::Protocol(format!("malformed transaction event: {}", e)))?;
			let succeeded = event.engine_result.as_ref().is_some_and(EngineResult::is_success);
			if forward_all_transactions || succeeded {
				Ok(Incoming::Event(ChannelEvent::Transaction(Box::new(event))))
			} else {
				Ok(Incoming::FilteredTransaction)
			}
		},
		"ledgerClosed" => {
			let event: LedgerClosedEvent = serde_json::from_value(data)
				.map_err(|e| ChannelError::Protocol(format!("malformed ledgerClosed event: {}", e)))?;
			Ok(Incoming::Event(ChannelEvent::LedgerClosed(event)))
		},
		other => Ok(Incoming::Unhandled(other.to_string())),
	}
}

fn decode_reply(data: &Value, kind: &str) -> Result<Value, ChannelError> {
	if kind != "response" {
		return Err(ChannelError::Protocol(format!(
			"expected a response frame, got type '{}'",
			kind
		)));
	}

	match data.get("status").and_then(Value::as_str) {
		Some("success") => Ok(data.get("result").cloned().unwrap_or(Value::Null)),
		Some("error") => Err(classify_error(data)),
		_ => Err(ChannelError::Protocol(format!(
			"Unknown result: {}",
			data.get("result").cloned().unwrap_or(Value::Null)
		))),
	}
}

/// Maps an error response to a structured error kind.
fn classify_error(data: &Value) -> ChannelError {
	let code = data
		.get("error")
		.and_then(Value::as_str)
		.unwrap_or("unknown")
		.to_string();
	let message = data
		.get("error_message")
		.and_then(Value::as_str)
		.map(str::to_string)
		.unwrap_or_else(|| code.clone());

	if code == NOT_SYNCED_CODE || message.starts_with("Not synced to") {
		ChannelError::NotSynced(message)
	} else {
		ChannelError::Remote { code, message }
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn transaction_frame(engine_result: &str) -> String {
		json!({
			"type": "transaction",
			"status": "closed",
			"validated": true,
			"engine_result": engine_result,
			"transaction": {
				"TransactionType": "Payment",
				"Account": "rSender",
				"Destination": "rReceiver",
				"hash": "H1"
			},
			"meta": {"TransactionResult": engine_result}
		})
		.to_string()
	}

	#[test]
	fn test_encode_request_merges_params() {
		let frame = encode_request(7, "subscribe", json!({"streams": ["ledger"]})).unwrap();
		let value: Value = serde_json::from_str(&frame).unwrap();
		assert_eq!(
			value,
			json!({"id": 7, "command": "subscribe", "streams": ["ledger"]})
		);
	}

	#[test]
	fn test_encode_request_rejects_non_object() {
		assert!(matches!(
			encode_request(1, "ping", json!([1, 2])),
			Err(ChannelError::Protocol(_))
		));
		assert!(encode_request(1, "ping", Value::Null).is_ok());
	}

	#[test]
	fn test_decode_success_response() {
		let frame = json!({"id": 3, "type": "response", "status": "success", "result": {"ok": 1}});
		let incoming = decode_frame(&frame.to_string(), false).unwrap();
		assert_eq!(
			incoming,
			Incoming::Response {
				id: 3,
				reply: Ok(json!({"ok": 1}))
			}
		);
	}

	#[test]
	fn test_decode_error_response() {
		let frame = json!({
			"id": 4,
			"type": "response",
			"status": "error",
			"error": "actNotFound",
			"error_message": "Account not found."
		});
		let incoming = decode_frame(&frame.to_string(), false).unwrap();
		assert_eq!(
			incoming,
			Incoming::Response {
				id: 4,
				reply: Err(ChannelError::Remote {
					code: "actNotFound".to_string(),
					message: "Account not found.".to_string()
				})
			}
		);
	}

	#[test]
	fn test_decode_not_synced_is_classified() {
		for frame in [
			json!({"id": 5, "type": "response", "status": "error", "error": "noNetwork"}),
			json!({
				"id": 5,
				"type": "response",
				"status": "error",
				"error": "unknown",
				"error_message": "Not synced to Ripple network."
			}),
		] {
			match decode_frame(&frame.to_string(), false).unwrap() {
				Incoming::Response { reply, .. } => {
					assert!(reply.unwrap_err().is_not_synced());
				},
				other => panic!("unexpected frame {:?}", other),
			}
		}
	}

	#[test]
	fn test_decode_unknown_status() {
		let frame = json!({"id": 6, "type": "response", "status": "weird"});
		match decode_frame(&frame.to_string(), false).unwrap() {
			Incoming::Response { reply, .. } => {
				assert!(matches!(reply, Err(ChannelError::Protocol(_))));
			},
			other => panic!("unexpected frame {:?}", other),
		}
	}

	#[test]
	fn test_transaction_filtering() {
		let failed = transaction_frame("tecPATH_DRY");
		assert_eq!(
			decode_frame(&failed, false).unwrap(),
			Incoming::FilteredTransaction
		);
		assert!(matches!(
			decode_frame(&failed, true).unwrap(),
			Incoming::Event(ChannelEvent::Transaction(_))
		));
		assert!(matches!(
			decode_frame(&transaction_frame("tesSUCCESS"), false).unwrap(),
			Incoming::Event(ChannelEvent::Transaction(_))
		));
	}

	#[test]
	fn test_decode_ledger_closed() {
		let frame = json!({"type": "ledgerClosed", "ledger_index": 101, "ledger_hash": "LH"});
		match decode_frame(&frame.to_string(), false).unwrap() {
			Incoming::Event(ChannelEvent::LedgerClosed(event)) => {
				assert_eq!(event.ledger_index, 101);
				assert_eq!(event.ledger_hash.as_deref(), Some("LH"));
			},
			other => panic!("unexpected frame {:?}", other),
		}
	}

	#[test]
	fn test_decode_unhandled_and_invalid() {
		let frame = json!({"type": "serverStatus", "load_factor": 256});
		assert_eq!(
			decode_frame(&frame.to_string(), false).unwrap(),
			Incoming::Unhandled("serverStatus".to_string())
		);
		assert!(decode_frame("not json", false).is_err());
	}
}
