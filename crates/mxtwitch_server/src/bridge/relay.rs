#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use mxtwitch_domain::{MatrixRoomId, MatrixUserId, TwitchChannel};
use mxtwitch_platform::twitch::TwitchInbound;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::BridgeContext;
use super::model::AsUser;
use super::session::TwitchSession;

#[derive(Debug, Clone)]
pub struct RelayConfig {
	pub server_name: String,
	/// Puppets are `@{puppet_prefix}{twitch_login}:{server_name}`.
	pub puppet_prefix: String,
	pub reconnect_delay: Duration,
	pub liveness_interval: Duration,
	pub inbound_capacity: usize,
}

impl RelayConfig {
	pub fn new(server_name: impl Into<String>, puppet_prefix: impl Into<String>) -> Self {
		Self {
			server_name: server_name.into(),
			puppet_prefix: puppet_prefix.into(),
			reconnect_delay: Duration::from_secs(5),
			liveness_interval: Duration::from_secs(5),
			inbound_capacity: 256,
		}
	}
}

/// Twitch → Matrix: the bot listens on every bound channel and chat lines are
/// posted into the bound room by a puppet per Twitch chatter.
pub struct Relay {
	ctx: BridgeContext,
	cfg: RelayConfig,
	joined: Mutex<HashSet<(MatrixUserId, MatrixRoomId)>>,
	stop: watch::Sender<bool>,
}

impl Relay {
	pub fn new(ctx: BridgeContext, cfg: RelayConfig) -> Self {
		let (stop, _) = watch::channel(false);
		Self {
			ctx,
			cfg,
			joined: Mutex::new(HashSet::new()),
			stop,
		}
	}

	pub fn puppet_id(&self, twitch_login: &str) -> anyhow::Result<MatrixUserId> {
		let localpart = format!("{}{}", self.cfg.puppet_prefix, twitch_login.to_ascii_lowercase());
		MatrixUserId::from_parts(&localpart, &self.cfg.server_name).context("build puppet id")
	}

	/// Start a bot session supervisor per bound channel plus the consumer that
	/// posts inbound lines into Matrix.
	pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
		let (tx, rx) = mpsc::channel(self.cfg.inbound_capacity.max(1));
		let mut handles = Vec::new();
		for link in self.ctx.registry.rooms() {
			handles.push(tokio::spawn(Arc::clone(&self).supervise_channel(link.channel, tx.clone())));
		}
		handles.push(tokio::spawn(self.consume(rx)));
		handles
	}

	pub fn stop(&self) {
		self.stop.send_replace(true);
	}

	async fn supervise_channel(self: Arc<Self>, channel: TwitchChannel, tx: mpsc::Sender<TwitchInbound>) {
		let bot = self.ctx.registry.bot().clone();
		let mut stop = self.stop.subscribe();

		loop {
			if *stop.borrow() {
				return;
			}

			let creds = bot.session_credentials();
			match self.ctx.sessions.ensure(&bot.mxid, creds.as_ref(), &channel).await {
				Ok(Some(session)) => {
					session.listen(tx.clone());
					info!(%channel, bot = %bot.twitch_name, "bot listening on twitch channel");
					if self.wait_closed(&session, &mut stop).await {
						return;
					}
					warn!(%channel, "bot session ended; reopening");
				}
				Ok(None) => {
					error!(%channel, "bot has no twitch credentials; inbound relay disabled");
					return;
				}
				Err(e) if e.is_auth() => {
					error!(%channel, error = %e, "twitch rejected bot credentials");
				}
				Err(e) => {
					warn!(%channel, error = %e, "bot session failed");
				}
			}

			tokio::select! {
				_ = tokio::time::sleep(self.cfg.reconnect_delay) => {}
				_ = stop.changed() => return,
			}
		}
	}

	/// Returns `true` if the relay is stopping.
	async fn wait_closed(&self, session: &TwitchSession, stop: &mut watch::Receiver<bool>) -> bool {
		let mut done = session.done();
		let mut tick = tokio::time::interval(self.cfg.liveness_interval);
		loop {
			tokio::select! {
				_ = done.changed() => return false,
				_ = stop.changed() => return true,
				_ = tick.tick() => {
					if !session.is_live() {
						return false;
					}
				}
			}
		}
	}

	async fn consume(self: Arc<Self>, mut rx: mpsc::Receiver<TwitchInbound>) {
		while let Some(msg) = rx.recv().await {
			if let Err(e) = self.relay(msg).await {
				warn!(error = %e, "failed to relay twitch message");
			}
		}
	}

	/// Post one Twitch chat line into its bound room. Returns `false` when the
	/// line was not relayed (unbound channel or bridge echo).
	pub async fn relay(&self, msg: TwitchInbound) -> anyhow::Result<bool> {
		let Some(link) = self.ctx.registry.room_for_channel(&msg.channel) else {
			debug!(channel = %msg.channel, "message for unbound channel");
			return Ok(false);
		};
		if self.ctx.registry.is_bridged_twitch_login(&msg.login) {
			debug!(login = %msg.login, "suppressing echo of bridged message");
			return Ok(false);
		}

		let puppet = self
			.ensure_puppet(&msg.login, msg.display_name.as_deref(), &link.room_id)
			.await?;
		if let Err(e) = self.ctx.matrix.send_text_as(&puppet, &link.room_id, &msg.text).await {
			// The puppet may have been kicked; rejoin before the next line.
			self.joined.lock().remove(&(puppet, link.room_id.clone()));
			return Err(anyhow::Error::new(e).context("post as puppet"));
		}
		metrics::counter!("mxtwitch_messages_to_matrix_total").increment(1);
		Ok(true)
	}

	async fn ensure_puppet(
		&self,
		twitch_login: &str,
		display_name: Option<&str>,
		room: &MatrixRoomId,
	) -> anyhow::Result<MatrixUserId> {
		let mxid = self.puppet_id(twitch_login)?;

		if self.ctx.registry.lookup_puppet(&mxid).is_none() {
			self.ctx
				.matrix
				.ensure_puppet(mxid.localpart())
				.await
				.context("register puppet")?;
			if let Some(name) = display_name.filter(|n| !n.trim().is_empty())
				&& let Err(e) = self.ctx.matrix.set_display_name_as(&mxid, name).await
			{
				debug!(puppet = %mxid, error = %e, "could not set puppet display name");
			}

			let puppet = AsUser {
				mxid: mxid.clone(),
				twitch_login: twitch_login.to_ascii_lowercase(),
			};
			if self.ctx.registry.register_puppet(puppet.clone()) {
				info!(puppet = %mxid, "provisioned puppet");
				if let Err(e) = self.ctx.store.save_as_user(&puppet).await {
					warn!(puppet = %mxid, error = %e, "failed to persist puppet");
				}
			}
		}

		let key = (mxid.clone(), room.clone());
		if !self.joined.lock().contains(&key) {
			self.ctx
				.matrix
				.join_room_as(&mxid, room)
				.await
				.context("join puppet to room")?;
			self.joined.lock().insert(key);
		}

		Ok(mxid)
	}
}
