#![forbid(unsafe_code)]

use mxtwitch_domain::{MatrixRoomId, MatrixUserId};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const ROOM_MEMBER: &str = "m.room.member";
pub const ROOM_MESSAGE: &str = "m.room.message";
pub const MSGTYPE_TEXT: &str = "m.text";

#[derive(Debug, Error)]
pub enum EventDecodeError {
	#[error("malformed event json: {0}")]
	Json(#[from] serde_json::Error),
	#[error("event has no room_id")]
	MissingRoom,
	#[error("invalid identifier: {0}")]
	InvalidId(#[from] mxtwitch_domain::ParseIdError),
}

/// Room event delivered by the home server, reduced to what the bridge acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeEvent {
	pub event_id: Option<String>,
	pub sender: MatrixUserId,
	pub room_id: MatrixRoomId,
	pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
	/// `m.room.member`; `target` is the state key (the user whose membership changed).
	Membership { target: MatrixUserId, membership: Membership },
	/// `m.room.message`.
	Message(MessageContent),
	/// Any other event type.
	Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Membership {
	Join,
	Leave,
	Invite,
	Ban,
	Knock,
	Other(String),
}

impl Membership {
	fn parse(s: &str) -> Self {
		match s {
			"join" => Self::Join,
			"leave" => Self::Leave,
			"invite" => Self::Invite,
			"ban" => Self::Ban,
			"knock" => Self::Knock,
			other => Self::Other(other.to_string()),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
	/// `m.text`; the only content relayed to Twitch.
	Text { body: String },
	/// Images, files, notices, emotes and anything else.
	Unsupported { msgtype: String, body: Option<String> },
}

#[derive(Debug, Deserialize)]
struct RawEvent {
	#[serde(rename = "type")]
	event_type: String,
	#[serde(default)]
	event_id: Option<String>,
	sender: String,
	#[serde(default)]
	room_id: Option<String>,
	#[serde(default)]
	state_key: Option<String>,
	#[serde(default)]
	content: serde_json::Value,
}

impl BridgeEvent {
	pub fn from_value(value: serde_json::Value) -> Result<Self, EventDecodeError> {
		let raw: RawEvent = serde_json::from_value(value)?;
		let sender = MatrixUserId::new(raw.sender)?;
		let room_id = MatrixRoomId::new(raw.room_id.ok_or(EventDecodeError::MissingRoom)?)?;
		let content = &raw.content;
		let str_field = |key: &str| content.get(key).and_then(|v| v.as_str());

		let kind = match raw.event_type.as_str() {
			ROOM_MEMBER => {
				let target = match raw.state_key.as_deref() {
					Some(key) if !key.trim().is_empty() => MatrixUserId::new(key)?,
					_ => sender.clone(),
				};
				let membership = Membership::parse(str_field("membership").unwrap_or_default());
				EventKind::Membership { target, membership }
			}
			ROOM_MESSAGE => {
				let msgtype = str_field("msgtype").unwrap_or_default();
				let body = str_field("body").map(str::to_string);
				match (msgtype, body) {
					(MSGTYPE_TEXT, Some(body)) => EventKind::Message(MessageContent::Text { body }),
					(msgtype, body) => EventKind::Message(MessageContent::Unsupported {
						msgtype: msgtype.to_string(),
						body,
					}),
				}
			}
			other => EventKind::Other(other.to_string()),
		};

		Ok(Self {
			event_id: raw.event_id,
			sender,
			room_id,
			kind,
		})
	}
}

/// Body of `PUT /_matrix/app/v1/transactions/{txnId}`.
#[derive(Debug, Deserialize)]
pub struct Transaction {
	#[serde(default)]
	pub events: Vec<serde_json::Value>,
}

/// Decode a transaction body, skipping events the bridge cannot represent.
pub fn decode_transaction(body: &[u8]) -> Result<Vec<BridgeEvent>, EventDecodeError> {
	let txn: Transaction = serde_json::from_slice(body)?;
	let mut out = Vec::with_capacity(txn.events.len());
	for raw in txn.events {
		match BridgeEvent::from_value(raw) {
			Ok(ev) => out.push(ev),
			Err(e) => debug!(error = %e, "skipping undecodable appservice event"),
		}
	}
	Ok(out)
}
