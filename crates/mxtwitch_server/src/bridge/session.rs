#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use mxtwitch_domain::{MatrixUserId, TwitchChannel};
use mxtwitch_platform::twitch::{SessionError, TwitchChat, TwitchConnector, TwitchInbound};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

use super::model::SessionCredentials;

#[derive(Debug, Clone)]
pub struct SessionConfig {
	/// Upper bound for each connect, join and send.
	pub op_timeout: Duration,
}

impl Default for SessionConfig {
	fn default() -> Self {
		Self {
			op_timeout: Duration::from_secs(10),
		}
	}
}

/// Live chat connection owned by one identity and joined to one channel.
pub struct TwitchSession {
	owner: MatrixUserId,
	channel: TwitchChannel,
	chat: Box<dyn TwitchChat>,
	done: watch::Sender<bool>,
}

impl std::fmt::Debug for TwitchSession {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TwitchSession")
			.field("owner", &self.owner)
			.field("channel", &self.channel)
			.field("live", &self.is_live())
			.finish()
	}
}

impl TwitchSession {
	pub fn owner(&self) -> &MatrixUserId {
		&self.owner
	}

	pub fn channel(&self) -> &TwitchChannel {
		&self.channel
	}

	pub fn is_live(&self) -> bool {
		!*self.done.borrow() && !self.chat.is_closed()
	}

	/// Resolves once `close` has been called.
	pub fn done(&self) -> watch::Receiver<bool> {
		self.done.subscribe()
	}

	/// Attach an inbound listener to the underlying chat connection.
	pub fn listen(&self, tx: mpsc::Sender<TwitchInbound>) {
		self.chat.listen(tx);
	}

	pub async fn close(&self) {
		if self.done.send_replace(true) {
			return;
		}
		self.chat.close().await;
		metrics::gauge!("mxtwitch_sessions_live").decrement(1.0);
		debug!(owner = %self.owner, channel = %self.channel, "twitch session closed");
	}
}

/// Outcome of a relay attempt that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
	Sent,
	/// The owner has no usable credentials yet; nothing was attempted.
	NotReady,
}

type SlotKey = (MatrixUserId, TwitchChannel);
type Slot = Arc<Mutex<Option<Arc<TwitchSession>>>>;

/// Opens, reuses and tears down Twitch sessions.
///
/// Each (owner, channel) pair has its own async lock; it is held from the
/// decision that a session is needed until the session is joined (and, for
/// sends, until the line has been handed to the connection). Unrelated pairs
/// never wait on each other.
pub struct SessionManager {
	connector: Arc<dyn TwitchConnector>,
	cfg: SessionConfig,
	slots: parking_lot::Mutex<HashMap<SlotKey, Slot>>,
}

impl SessionManager {
	pub fn new(connector: Arc<dyn TwitchConnector>, cfg: SessionConfig) -> Self {
		Self {
			connector,
			cfg,
			slots: parking_lot::Mutex::new(HashMap::new()),
		}
	}

	fn slot(&self, owner: &MatrixUserId, channel: &TwitchChannel) -> Slot {
		let mut slots = self.slots.lock();
		Arc::clone(
			slots
				.entry((owner.clone(), channel.clone()))
				.or_insert_with(|| Arc::new(Mutex::new(None))),
		)
	}

	async fn bounded<T>(
		&self,
		op: &'static str,
		fut: impl Future<Output = Result<T, SessionError>>,
	) -> Result<T, SessionError> {
		match tokio::time::timeout(self.cfg.op_timeout, fut).await {
			Ok(res) => res,
			Err(_) => {
				metrics::counter!("mxtwitch_session_timeouts_total", "op" => op).increment(1);
				Err(SessionError::Timeout { op })
			}
		}
	}

	/// Return the live session in `slot`, opening and joining one if needed.
	/// `None` means the owner is not ready (no credentials).
	async fn ensure_locked(
		&self,
		slot: &mut Option<Arc<TwitchSession>>,
		owner: &MatrixUserId,
		creds: Option<&SessionCredentials>,
		channel: &TwitchChannel,
	) -> Result<Option<Arc<TwitchSession>>, SessionError> {
		if let Some(existing) = slot.as_ref() {
			if existing.is_live() {
				return Ok(Some(Arc::clone(existing)));
			}
			debug!(%owner, %channel, "discarding closed twitch session");
			if let Some(stale) = slot.take() {
				stale.close().await;
			}
		}

		let Some(creds) = creds else {
			return Ok(None);
		};

		let chat = self
			.bounded("connect", self.connector.connect(&creds.token, &creds.login))
			.await?;

		if let Err(e) = self.bounded("join", chat.join(channel)).await {
			chat.close().await;
			return Err(e);
		}

		let (done, _) = watch::channel(false);
		let session = Arc::new(TwitchSession {
			owner: owner.clone(),
			channel: channel.clone(),
			chat,
			done,
		});
		metrics::counter!("mxtwitch_sessions_opened_total").increment(1);
		metrics::gauge!("mxtwitch_sessions_live").increment(1.0);
		info!(%owner, %channel, login = %creds.login, "twitch session open");

		*slot = Some(Arc::clone(&session));
		Ok(Some(session))
	}

	/// Obtain the live session for (owner, channel), opening it on first use.
	pub async fn ensure(
		&self,
		owner: &MatrixUserId,
		creds: Option<&SessionCredentials>,
		channel: &TwitchChannel,
	) -> Result<Option<Arc<TwitchSession>>, SessionError> {
		let slot = self.slot(owner, channel);
		let mut guard = slot.lock().await;
		self.ensure_locked(&mut guard, owner, creds, channel).await
	}

	/// Send `body` to `channel` on the owner's session. The slot lock is held
	/// across ensure and send; any failure leaves the slot empty so the next
	/// call starts from scratch.
	pub async fn send(
		&self,
		owner: &MatrixUserId,
		creds: Option<&SessionCredentials>,
		channel: &TwitchChannel,
		body: &str,
	) -> Result<SendOutcome, SessionError> {
		let outcome = {
			let slot = self.slot(owner, channel);
			let mut guard = slot.lock().await;
			self.send_locked(&mut guard, owner, creds, channel, body).await
		};
		if !matches!(outcome, Ok(SendOutcome::Sent)) {
			self.prune_empty_slots();
		}
		outcome
	}

	async fn send_locked(
		&self,
		slot: &mut Option<Arc<TwitchSession>>,
		owner: &MatrixUserId,
		creds: Option<&SessionCredentials>,
		channel: &TwitchChannel,
		body: &str,
	) -> Result<SendOutcome, SessionError> {
		let Some(session) = self.ensure_locked(slot, owner, creds, channel).await? else {
			return Ok(SendOutcome::NotReady);
		};

		match self.bounded("send", session.chat.send(channel, body)).await {
			Ok(()) => {
				metrics::counter!("mxtwitch_messages_to_twitch_total").increment(1);
				Ok(SendOutcome::Sent)
			}
			Err(e) => {
				warn!(%owner, %channel, error = %e, "twitch send failed; resetting session");
				slot.take();
				session.close().await;
				Err(e)
			}
		}
	}

	/// Drop slots that hold no session and that no caller is using. A slot
	/// reachable only from the map cannot be handed out without the map lock.
	fn prune_empty_slots(&self) {
		self.slots.lock().retain(|_, slot| {
			Arc::strong_count(slot) > 1 || slot.try_lock().map(|guard| guard.is_some()).unwrap_or(true)
		});
	}

	#[cfg(test)]
	pub(crate) fn slot_count(&self) -> usize {
		self.slots.lock().len()
	}

	/// Close every session owned by `owner`.
	pub async fn close_owner(&self, owner: &MatrixUserId) {
		let slots: Vec<Slot> = self
			.slots
			.lock()
			.iter()
			.filter(|((o, _), _)| o == owner)
			.map(|(_, slot)| Arc::clone(slot))
			.collect();

		for slot in slots {
			if let Some(session) = slot.lock().await.take() {
				session.close().await;
			}
		}
		self.prune_empty_slots();
	}

	pub async fn shutdown(&self) {
		let slots: Vec<Slot> = self.slots.lock().drain().map(|(_, slot)| slot).collect();
		for slot in slots {
			if let Some(session) = slot.lock().await.take() {
				session.close().await;
			}
		}
		info!("all twitch sessions closed");
	}

	/// Number of live sessions. Slots busy opening or sending are not counted.
	pub fn live_count(&self) -> usize {
		self.slots
			.lock()
			.values()
			.filter(|slot| {
				slot.try_lock()
					.map(|guard| guard.as_ref().is_some_and(|s| s.is_live()))
					.unwrap_or(false)
			})
			.count()
	}
}
