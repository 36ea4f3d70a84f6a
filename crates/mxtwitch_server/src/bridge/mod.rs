#![forbid(unsafe_code)]

pub mod dispatcher;
pub mod login;
pub mod model;
pub mod registry;
pub mod relay;
pub mod session;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;






use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use mxtwitch_platform::matrix::MatrixApi;
use tracing::info;

use self::login::LoginFlow;
use self::model::{BotUser, RoomLink};
use self::registry::SessionRegistry;
use self::session::SessionManager;
use self::store::BridgeStore;

/// Shared handles for the dispatcher, the relay and the HTTP surfaces.
#[derive(Clone)]
pub struct BridgeContext {
	pub registry: Arc<SessionRegistry>,
	pub sessions: Arc<SessionManager>,
	pub login: Arc<LoginFlow>,
	pub matrix: Arc<dyn MatrixApi>,
	pub store: Arc<dyn BridgeStore>,
}

/// Upsert config-provided records, then build the registry from storage.
pub async fn load_registry(
	store: &dyn BridgeStore,
	seed_rooms: &[RoomLink],
	seed_bot: Option<&BotUser>,
) -> anyhow::Result<SessionRegistry> {
	for link in seed_rooms {
		store
			.save_room_link(link)
			.await
			.with_context(|| format!("seed room link {} -> {}", link.room_id, link.channel))?;
	}
	if let Some(bot) = seed_bot {
		store.save_bot_user(bot).await.context("seed bot user")?;
	}

	let rooms = store.load_room_links().await.context("load room links")?;
	let users = store.load_real_users().await.context("load real users")?;
	let puppets = store.load_as_users().await.context("load puppets")?;
	let bot = store
		.load_bot_user()
		.await
		.context("load bot user")?
		.ok_or_else(|| anyhow!("no bot user configured (set [bot] in the config)"))?;

	let registry = SessionRegistry::new(bot, rooms, users, puppets);
	let counts = registry.counts();
	info!(
		rooms = counts.rooms,
		users = counts.users,
		puppets = counts.puppets,
		"bridge state loaded"
	);
	Ok(registry)
}
