#![forbid(unsafe_code)]

use mxtwitch_domain::{MatrixRoomId, MatrixUserId, TwitchChannel};
use mxtwitch_platform::SecretString;

/// Binding of one Matrix room to one Twitch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomLink {
	pub room_id: MatrixRoomId,
	pub channel: TwitchChannel,
}

/// What a Twitch chat connection needs to authenticate.
#[derive(Debug, Clone)]
pub struct SessionCredentials {
	pub login: String,
	pub token: SecretString,
}

impl SessionCredentials {
	/// `None` unless both the login and the token are non-blank.
	pub fn new(login: Option<&str>, token: Option<&SecretString>) -> Option<Self> {
		let login = login.map(str::trim).filter(|l| !l.is_empty())?;
		let token = token.filter(|t| !t.is_blank())?;
		Some(Self {
			login: login.to_string(),
			token: token.clone(),
		})
	}
}

/// A Matrix user bridging their own Twitch account.
#[derive(Debug, Clone)]
pub struct RealUser {
	pub mxid: MatrixUserId,
	pub twitch_name: Option<String>,
	pub access_token: Option<SecretString>,
	pub refresh_token: Option<SecretString>,
}

impl RealUser {
	pub fn new(mxid: MatrixUserId) -> Self {
		Self {
			mxid,
			twitch_name: None,
			access_token: None,
			refresh_token: None,
		}
	}

	pub fn has_token(&self) -> bool {
		self.access_token.as_ref().is_some_and(|t| !t.is_blank())
	}

	pub fn session_credentials(&self) -> Option<SessionCredentials> {
		SessionCredentials::new(self.twitch_name.as_deref(), self.access_token.as_ref())
	}
}

/// Puppet account standing in for a Twitch chatter inside Matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsUser {
	pub mxid: MatrixUserId,
	pub twitch_login: String,
}

/// The bridge's own identity on both sides.
#[derive(Debug, Clone)]
pub struct BotUser {
	pub mxid: MatrixUserId,
	pub twitch_name: String,
	pub access_token: SecretString,
}

impl BotUser {
	pub fn session_credentials(&self) -> Option<SessionCredentials> {
		SessionCredentials::new(Some(&self.twitch_name), Some(&self.access_token))
	}
}
