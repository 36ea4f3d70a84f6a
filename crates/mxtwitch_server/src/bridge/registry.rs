#![forbid(unsafe_code)]

use std::collections::HashMap;

use mxtwitch_domain::{MatrixRoomId, MatrixUserId, TwitchChannel};
use mxtwitch_platform::SecretString;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::warn;

use super::model::{AsUser, BotUser, RealUser, RoomLink};

/// Process-wide lookup tables for rooms, bridged users and puppets.
///
/// Every read-modify-write runs under the relevant write lock, so callers on
/// different tasks never observe a half-created record.
#[derive(Debug)]
pub struct SessionRegistry {
	bot: BotUser,
	rooms: RwLock<HashMap<MatrixRoomId, RoomLink>>,
	channels: RwLock<HashMap<TwitchChannel, MatrixRoomId>>,
	users: RwLock<HashMap<MatrixUserId, RealUser>>,
	puppets: RwLock<HashMap<MatrixUserId, AsUser>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryCounts {
	pub rooms: usize,
	pub users: usize,
	pub authenticated_users: usize,
	pub puppets: usize,
}

impl SessionRegistry {
	pub fn new(bot: BotUser, rooms: Vec<RoomLink>, users: Vec<RealUser>, puppets: Vec<AsUser>) -> Self {
		let registry = Self {
			bot,
			rooms: RwLock::new(HashMap::new()),
			channels: RwLock::new(HashMap::new()),
			users: RwLock::new(users.into_iter().map(|u| (u.mxid.clone(), u)).collect()),
			puppets: RwLock::new(puppets.into_iter().map(|p| (p.mxid.clone(), p)).collect()),
		};
		for link in rooms {
			registry.bind_room(link);
		}
		registry
	}

	pub fn bot(&self) -> &BotUser {
		&self.bot
	}

	pub fn is_bot(&self, mxid: &MatrixUserId) -> bool {
		&self.bot.mxid == mxid
	}

	/// Bind a room to a channel. A channel already bound to another room, or
	/// a room already bound to another channel, is rejected; the first
	/// binding wins.
	pub fn bind_room(&self, link: RoomLink) -> bool {
		let mut rooms = self.rooms.write();
		let mut channels = self.channels.write();

		if let Some(existing) = rooms.get(&link.room_id) {
			if existing.channel != link.channel {
				warn!(room = %link.room_id, bound = %existing.channel, rejected = %link.channel, "room already bound to another channel");
			}
			return false;
		}
		if let Some(existing) = channels.get(&link.channel) {
			warn!(channel = %link.channel, bound = %existing, rejected = %link.room_id, "channel already bound to another room");
			return false;
		}

		channels.insert(link.channel.clone(), link.room_id.clone());
		rooms.insert(link.room_id.clone(), link);
		true
	}

	pub fn lookup_room(&self, room: &MatrixRoomId) -> Option<RoomLink> {
		self.rooms.read().get(room).cloned()
	}

	pub fn room_for_channel(&self, channel: &TwitchChannel) -> Option<RoomLink> {
		let room = self.channels.read().get(channel).cloned()?;
		self.lookup_room(&room)
	}

	pub fn rooms(&self) -> Vec<RoomLink> {
		let mut out: Vec<_> = self.rooms.read().values().cloned().collect();
		out.sort_by(|a, b| a.room_id.cmp(&b.room_id));
		out
	}

	pub fn lookup_user(&self, mxid: &MatrixUserId) -> Option<RealUser> {
		self.users.read().get(mxid).cloned()
	}

	pub fn lookup_puppet(&self, mxid: &MatrixUserId) -> Option<AsUser> {
		self.puppets.read().get(mxid).cloned()
	}

	/// Insert or replace a user record.
	pub fn register_user(&self, user: RealUser) {
		self.users.write().insert(user.mxid.clone(), user);
	}

	/// Returns the record and whether this call created it.
	pub fn get_or_create_user(&self, mxid: &MatrixUserId) -> (RealUser, bool) {
		let mut users = self.users.write();
		if let Some(existing) = users.get(mxid) {
			return (existing.clone(), false);
		}
		let user = RealUser::new(mxid.clone());
		users.insert(mxid.clone(), user.clone());
		(user, true)
	}

	/// Bind Twitch credentials to a user, creating the record if needed.
	pub fn set_credentials(
		&self,
		mxid: &MatrixUserId,
		twitch_name: &str,
		access_token: SecretString,
		refresh_token: Option<SecretString>,
	) -> RealUser {
		let mut users = self.users.write();
		let user = users.entry(mxid.clone()).or_insert_with(|| RealUser::new(mxid.clone()));
		user.twitch_name = Some(twitch_name.to_string());
		user.access_token = Some(access_token);
		user.refresh_token = refresh_token;
		user.clone()
	}

	/// Drop a user's credentials; `None` if the user is unknown.
	pub fn clear_credentials(&self, mxid: &MatrixUserId) -> Option<RealUser> {
		let mut users = self.users.write();
		let user = users.get_mut(mxid)?;
		user.access_token = None;
		user.refresh_token = None;
		Some(user.clone())
	}

	/// Returns `false` if a puppet with this id was already registered.
	pub fn register_puppet(&self, puppet: AsUser) -> bool {
		let mut puppets = self.puppets.write();
		if puppets.contains_key(&puppet.mxid) {
			return false;
		}
		puppets.insert(puppet.mxid.clone(), puppet);
		true
	}

	/// Whether `login` is the bot's Twitch account or belongs to a bridged user.
	pub fn is_bridged_twitch_login(&self, login: &str) -> bool {
		if self.bot.twitch_name.eq_ignore_ascii_case(login) {
			return true;
		}
		self.users
			.read()
			.values()
			.any(|u| u.has_token() && u.twitch_name.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(login)))
	}

	pub fn counts(&self) -> RegistryCounts {
		let users = self.users.read();
		RegistryCounts {
			rooms: self.rooms.read().len(),
			users: users.len(),
			authenticated_users: users.values().filter(|u| u.has_token()).count(),
			puppets: self.puppets.read().len(),
		}
	}
}
