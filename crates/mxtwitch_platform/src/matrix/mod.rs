#![forbid(unsafe_code)]

mod client;
pub mod event;
pub mod registration;

use async_trait::async_trait;
use mxtwitch_domain::{MatrixRoomId, MatrixUserId};
use thiserror::Error;

pub use client::{HomeserverClient, HomeserverConfig};
pub use event::{BridgeEvent, EventKind, Membership, MessageContent, decode_transaction};
pub use registration::Registration;

#[derive(Debug, Error)]
pub enum MatrixError {
	#[error("matrix request failed: {0}")]
	Http(#[from] reqwest::Error),
	#[error("matrix api error: status={status} errcode={errcode} error={error}")]
	Api { status: u16, errcode: String, error: String },
	#[error("matrix response invalid: {0}")]
	InvalidResponse(String),
	#[error("invalid matrix url: {0}")]
	Url(#[from] url::ParseError),
}

impl MatrixError {
	pub fn errcode(&self) -> Option<&str> {
		match self {
			Self::Api { errcode, .. } => Some(errcode.as_str()),
			_ => None,
		}
	}
}

/// Client-server operations the bridge performs against the home server.
#[async_trait]
pub trait MatrixApi: Send + Sync + 'static {
	/// Profile display name; `None` when the user has not set one.
	async fn display_name(&self, user: &MatrixUserId) -> Result<Option<String>, MatrixError>;

	/// Post an `m.notice` into a room as the bridge bot.
	async fn send_notice(&self, room: &MatrixRoomId, text: &str) -> Result<(), MatrixError>;

	/// Deliver a private notice to a user through a direct room owned by the bot.
	async fn notify_user(&self, user: &MatrixUserId, text: &str) -> Result<(), MatrixError>;

	/// Register a puppet account; an already registered account is not an error.
	async fn ensure_puppet(&self, localpart: &str) -> Result<(), MatrixError>;

	async fn set_display_name_as(&self, user: &MatrixUserId, name: &str) -> Result<(), MatrixError>;

	async fn join_room_as(&self, user: &MatrixUserId, room: &MatrixRoomId) -> Result<(), MatrixError>;

	async fn send_text_as(&self, user: &MatrixUserId, room: &MatrixRoomId, text: &str) -> Result<(), MatrixError>;
}
