#![forbid(unsafe_code)]

use std::str::FromStr;

use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use mxtwitch_domain::{MatrixRoomId, MatrixUserId, TwitchChannel};
use mxtwitch_platform::SecretString;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::warn;

use super::model::{AsUser, BotUser, RealUser, RoomLink};

/// Durable storage for bridge records.
#[async_trait]
pub trait BridgeStore: Send + Sync + 'static {
	async fn load_room_links(&self) -> anyhow::Result<Vec<RoomLink>>;

	async fn load_real_users(&self) -> anyhow::Result<Vec<RealUser>>;

	async fn load_as_users(&self) -> anyhow::Result<Vec<AsUser>>;

	async fn load_bot_user(&self) -> anyhow::Result<Option<BotUser>>;

	async fn save_user(&self, user: &RealUser) -> anyhow::Result<()>;

	async fn save_as_user(&self, user: &AsUser) -> anyhow::Result<()>;

	async fn save_room_link(&self, link: &RoomLink) -> anyhow::Result<()>;

	async fn save_bot_user(&self, bot: &BotUser) -> anyhow::Result<()>;
}

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqlStore {
	pool: sqlx::SqlitePool,
}

impl SqlStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if !database_url.starts_with("sqlite:") {
			return Err(anyhow!("unsupported database_url (use sqlite:)"));
		}

		let options = SqliteConnectOptions::from_str(database_url)
			.context("parse sqlite url")?
			.create_if_missing(true);
		// Each connection to an in-memory database gets its own database.
		let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
		let pool = SqlitePoolOptions::new()
			.max_connections(max_connections)
			.connect_with(options)
			.await
			.context("connect sqlite")?;

		sqlx::migrate!("migrations/sqlite")
			.run(&pool)
			.await
			.context("run sqlite migrations")?;

		Ok(Self { pool })
	}
}

fn secret(v: Option<String>) -> Option<SecretString> {
	v.filter(|s| !s.trim().is_empty()).map(SecretString::new)
}

#[async_trait]
impl BridgeStore for SqlStore {
	async fn load_room_links(&self) -> anyhow::Result<Vec<RoomLink>> {
		let rows: Vec<(String, String)> = sqlx::query_as("SELECT room_id, channel FROM room_links ORDER BY created_at, rowid")
			.fetch_all(&self.pool)
			.await
			.context("select room_links")?;

		let mut out = Vec::with_capacity(rows.len());
		for (room_id, channel) in rows {
			match (MatrixRoomId::new(room_id.as_str()), TwitchChannel::new(&channel)) {
				(Ok(room_id), Ok(channel)) => out.push(RoomLink { room_id, channel }),
				(room, chan) => {
					warn!(%room_id, %channel, room_ok = room.is_ok(), channel_ok = chan.is_ok(), "skipping invalid room link row");
				}
			}
		}
		Ok(out)
	}

	async fn load_real_users(&self) -> anyhow::Result<Vec<RealUser>> {
		let rows: Vec<(String, Option<String>, Option<String>, Option<String>)> =
			sqlx::query_as("SELECT mxid, twitch_name, access_token, refresh_token FROM real_users")
				.fetch_all(&self.pool)
				.await
				.context("select real_users")?;

		let mut out = Vec::with_capacity(rows.len());
		for (mxid, twitch_name, access_token, refresh_token) in rows {
			let Ok(id) = MatrixUserId::new(mxid.as_str()) else {
				warn!(%mxid, "skipping invalid real user row");
				continue;
			};
			out.push(RealUser {
				mxid: id,
				twitch_name: twitch_name.filter(|s| !s.trim().is_empty()),
				access_token: secret(access_token),
				refresh_token: secret(refresh_token),
			});
		}
		Ok(out)
	}

	async fn load_as_users(&self) -> anyhow::Result<Vec<AsUser>> {
		let rows: Vec<(String, String)> = sqlx::query_as("SELECT mxid, twitch_login FROM as_users")
			.fetch_all(&self.pool)
			.await
			.context("select as_users")?;

		let mut out = Vec::with_capacity(rows.len());
		for (mxid, twitch_login) in rows {
			let Ok(id) = MatrixUserId::new(mxid.as_str()) else {
				warn!(%mxid, "skipping invalid puppet row");
				continue;
			};
			out.push(AsUser { mxid: id, twitch_login });
		}
		Ok(out)
	}

	async fn load_bot_user(&self) -> anyhow::Result<Option<BotUser>> {
		let row: Option<(String, String, String)> =
			sqlx::query_as("SELECT mxid, twitch_name, access_token FROM bot_user WHERE id = 1")
				.fetch_optional(&self.pool)
				.await
				.context("select bot_user")?;

		let Some((mxid, twitch_name, access_token)) = row else {
			return Ok(None);
		};
		let mxid = MatrixUserId::new(mxid).context("bot_user.mxid")?;
		Ok(Some(BotUser {
			mxid,
			twitch_name,
			access_token: SecretString::new(access_token),
		}))
	}

	async fn save_user(&self, user: &RealUser) -> anyhow::Result<()> {
		sqlx::query(
			"INSERT INTO real_users (mxid, twitch_name, access_token, refresh_token, updated_at) \
			VALUES (?, ?, ?, ?, strftime('%s','now')) \
			ON CONFLICT(mxid) DO UPDATE SET \
			twitch_name = excluded.twitch_name, access_token = excluded.access_token, \
			refresh_token = excluded.refresh_token, updated_at = excluded.updated_at",
		)
		.bind(user.mxid.as_str())
		.bind(user.twitch_name.as_deref())
		.bind(user.access_token.as_ref().map(|t| t.expose()))
		.bind(user.refresh_token.as_ref().map(|t| t.expose()))
		.execute(&self.pool)
		.await
		.context("upsert real_users")?;
		Ok(())
	}

	async fn save_as_user(&self, user: &AsUser) -> anyhow::Result<()> {
		sqlx::query(
			"INSERT INTO as_users (mxid, twitch_login, created_at) VALUES (?, ?, strftime('%s','now')) \
			ON CONFLICT(mxid) DO UPDATE SET twitch_login = excluded.twitch_login",
		)
		.bind(user.mxid.as_str())
		.bind(user.twitch_login.as_str())
		.execute(&self.pool)
		.await
		.context("upsert as_users")?;
		Ok(())
	}

	async fn save_room_link(&self, link: &RoomLink) -> anyhow::Result<()> {
		sqlx::query(
			"INSERT INTO room_links (room_id, channel, created_at) VALUES (?, ?, strftime('%s','now')) \
			ON CONFLICT(room_id) DO UPDATE SET channel = excluded.channel",
		)
		.bind(link.room_id.as_str())
		.bind(link.channel.as_str())
		.execute(&self.pool)
		.await
		.context("upsert room_links")?;
		Ok(())
	}

	async fn save_bot_user(&self, bot: &BotUser) -> anyhow::Result<()> {
		sqlx::query(
			"INSERT INTO bot_user (id, mxid, twitch_name, access_token, updated_at) \
			VALUES (1, ?, ?, ?, strftime('%s','now')) \
			ON CONFLICT(id) DO UPDATE SET \
			mxid = excluded.mxid, twitch_name = excluded.twitch_name, \
			access_token = excluded.access_token, updated_at = excluded.updated_at",
		)
		.bind(bot.mxid.as_str())
		.bind(bot.twitch_name.as_str())
		.bind(bot.access_token.expose())
		.execute(&self.pool)
		.await
		.context("upsert bot_user")?;
		Ok(())
	}
}
