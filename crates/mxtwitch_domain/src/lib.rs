#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Matrix user identifier (`@localpart:server`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MatrixUserId(String);

impl MatrixUserId {
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		let id = id.trim();
		if id.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if !id.starts_with('@') || id.len() < 2 {
			return Err(ParseIdError::InvalidFormat(format!("user id must start with '@': {id}")));
		}
		Ok(Self(id.to_string()))
	}

	/// Build `@{localpart}:{server_name}`.
	pub fn from_parts(localpart: &str, server_name: &str) -> Result<Self, ParseIdError> {
		Self::new(format!("@{localpart}:{server_name}"))
	}

	/// Text between the sigil and the first `:`.
	pub fn localpart(&self) -> &str {
		let rest = &self.0[1..];
		rest.split_once(':').map(|(local, _)| local).unwrap_or(rest)
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for MatrixUserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for MatrixUserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		MatrixUserId::new(s)
	}
}

impl<'de> Deserialize<'de> for MatrixUserId {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		MatrixUserId::new(s).map_err(serde::de::Error::custom)
	}
}

/// Matrix room identifier (`!opaque:server`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MatrixRoomId(String);

impl MatrixRoomId {
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		let id = id.trim();
		if id.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if !id.starts_with('!') || id.len() < 2 {
			return Err(ParseIdError::InvalidFormat(format!("room id must start with '!': {id}")));
		}
		Ok(Self(id.to_string()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for MatrixRoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for MatrixRoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		MatrixRoomId::new(s)
	}
}

impl<'de> Deserialize<'de> for MatrixRoomId {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		MatrixRoomId::new(s).map_err(serde::de::Error::custom)
	}
}

/// Twitch channel login, stored without the leading `#`.
///
/// Twitch logins are case-insensitive and limited to `[a-z0-9_]`, so the
/// value is lowercased on construction. `#Chan`, `chan` and ` #chan ` all
/// name the same channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TwitchChannel(String);

impl TwitchChannel {
	pub fn new(name: impl AsRef<str>) -> Result<Self, ParseIdError> {
		let name = name.as_ref().trim();
		let name = name.strip_prefix('#').unwrap_or(name).trim();
		if name.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let name = name.to_ascii_lowercase();
		if !name.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_') {
			return Err(ParseIdError::InvalidFormat(format!("invalid twitch channel name: {name}")));
		}
		Ok(Self(name))
	}

	/// Login without the `#`.
	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// IRC channel form (`#login`).
	pub fn irc_name(&self) -> String {
		format!("#{}", self.0)
	}
}

impl fmt::Display for TwitchChannel {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "#{}", self.0)
	}
}

impl FromStr for TwitchChannel {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		TwitchChannel::new(s)
	}
}

impl<'de> Deserialize<'de> for TwitchChannel {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		TwitchChannel::new(s).map_err(serde::de::Error::custom)
	}
}
