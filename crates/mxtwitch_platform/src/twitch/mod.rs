#![forbid(unsafe_code)]

mod chat;
pub mod irc;
pub mod oauth;

use async_trait::async_trait;
use mxtwitch_domain::TwitchChannel;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::SecretString;

pub use chat::{IrcConnector, IrcConnectorConfig};
pub use oauth::{OAuthClient, OAuthConfig, OAuthError, TwitchOAuth, TwitchToken, TwitchTokenValidation, authorize_url};

/// Failures of a Twitch chat session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
	#[error("twitch connect failed: {0}")]
	Connect(String),
	/// Twitch rejected the credentials (revoked or expired token).
	#[error("twitch rejected credentials: {0}")]
	Auth(String),
	#[error("twitch join {channel} failed: {detail}")]
	Join { channel: String, detail: String },
	#[error("twitch send failed: {0}")]
	Send(String),
	#[error("twitch {op} timed out")]
	Timeout { op: &'static str },
	#[error("twitch session closed")]
	Closed,
}

impl SessionError {
	pub fn is_auth(&self) -> bool {
		matches!(self, Self::Auth(_))
	}
}

/// A chat line received from Twitch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwitchInbound {
	pub channel: TwitchChannel,
	pub login: String,
	pub display_name: Option<String>,
	pub text: String,
}

/// Opens chat connections on behalf of one Twitch account.
#[async_trait]
pub trait TwitchConnector: Send + Sync + 'static {
	async fn connect(&self, token: &SecretString, login: &str) -> Result<Box<dyn TwitchChat>, SessionError>;
}

/// One authenticated chat connection.
#[async_trait]
pub trait TwitchChat: Send + Sync + 'static {
	/// Join a channel; resolves once Twitch confirms membership.
	async fn join(&self, channel: &TwitchChannel) -> Result<(), SessionError>;

	async fn send(&self, channel: &TwitchChannel, body: &str) -> Result<(), SessionError>;

	/// Forward inbound chat lines to `tx` until the connection ends.
	fn listen(&self, tx: mpsc::Sender<TwitchInbound>);

	async fn close(&self);

	fn is_closed(&self) -> bool;
}
