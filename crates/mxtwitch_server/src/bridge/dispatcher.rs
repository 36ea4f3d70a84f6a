#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mxtwitch_domain::{MatrixRoomId, MatrixUserId};
use mxtwitch_platform::matrix::{BridgeEvent, EventKind, Membership, MessageContent};
use mxtwitch_platform::twitch::SessionError;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use super::BridgeContext;
use super::session::SendOutcome;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
	/// Queued messages per identity before new ones are dropped.
	pub worker_queue_capacity: usize,
	/// A worker with nothing to do for this long exits; the next message spawns a new one.
	pub worker_idle_timeout: Duration,
}

impl Default for DispatcherConfig {
	fn default() -> Self {
		Self {
			worker_queue_capacity: 32,
			worker_idle_timeout: Duration::from_secs(300),
		}
	}
}

type Workers = Arc<Mutex<HashMap<MatrixUserId, mpsc::Sender<MessageJob>>>>;

#[derive(Debug)]
struct MessageJob {
	room: MatrixRoomId,
	content: MessageContent,
}

/// Consumes appservice events and drives user and session state.
///
/// Membership events are handled inline. Message events go to a worker per
/// sending identity, so a slow Twitch connect for one user never holds up
/// anyone else while each user's messages keep their order.
pub struct Dispatcher {
	ctx: BridgeContext,
	cfg: DispatcherConfig,
	workers: Workers,
}

impl Dispatcher {
	pub fn new(ctx: BridgeContext, cfg: DispatcherConfig) -> Self {
		Self {
			ctx,
			cfg,
			workers: Arc::new(Mutex::new(HashMap::new())),
		}
	}

	#[cfg(test)]
	pub(crate) fn active_workers(&self) -> usize {
		self.workers.lock().len()
	}

	fn spawn_worker(&self, sender: &MatrixUserId) -> mpsc::Sender<MessageJob> {
		spawn_worker(
			self.ctx.clone(),
			Arc::clone(&self.workers),
			sender.clone(),
			&self.cfg,
		)
	}

	pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<BridgeEvent>) {
		while let Some(event) = rx.recv().await {
			self.dispatch(event).await;
		}
		info!("event queue closed; dispatcher stopped");
	}

	pub async fn dispatch(&self, event: BridgeEvent) {
		metrics::counter!("mxtwitch_events_received_total").increment(1);

		if self.ctx.registry.lookup_room(&event.room_id).is_none() {
			debug!(room = %event.room_id, "event for unbound room ignored");
			return;
		}

		match event.kind {
			EventKind::Membership {
				target,
				membership: Membership::Join,
			} => self.handle_join(&target).await,
			EventKind::Message(content) => self.enqueue_message(event.sender, event.room_id, content),
			EventKind::Membership { .. } | EventKind::Other(_) => {}
		}
	}

	/// Bot and puppet identities are never provisioned or relayed.
	fn is_ignored(&self, user: &MatrixUserId) -> bool {
		self.ctx.registry.is_bot(user) || self.ctx.registry.lookup_puppet(user).is_some()
	}

	async fn handle_join(&self, user: &MatrixUserId) {
		if self.is_ignored(user) {
			return;
		}

		let (record, created) = self.ctx.registry.get_or_create_user(user);
		if created {
			info!(%user, "new bridged user");
			metrics::counter!("mxtwitch_users_created_total").increment(1);
			if let Err(e) = self.ctx.store.save_user(&record).await {
				warn!(%user, error = %e, "failed to persist new user");
			}
		}

		if record.has_token() {
			return;
		}

		if let Err(e) = self.ctx.login.send_login_url(user).await {
			warn!(%user, error = %e, "failed to send login url");
		}
	}

	fn enqueue_message(&self, sender: MatrixUserId, room: MatrixRoomId, content: MessageContent) {
		if self.is_ignored(&sender) {
			return;
		}
		if self.ctx.registry.lookup_user(&sender).is_none() {
			debug!(%sender, "message from identity that never joined; dropping");
			return;
		}

		let job = MessageJob { room, content };
		let mut workers = self.workers.lock();
		let tx = workers
			.entry(sender.clone())
			.or_insert_with(|| self.spawn_worker(&sender))
			.clone();

		match tx.try_send(job) {
			Ok(()) => {}
			Err(TrySendError::Full(_)) => {
				warn!(%sender, "message queue full; dropping message");
				metrics::counter!("mxtwitch_messages_dropped_total").increment(1);
			}
			Err(TrySendError::Closed(job)) => {
				let fresh = self.spawn_worker(&sender);
				let _ = fresh.try_send(job);
				workers.insert(sender, fresh);
			}
		}
	}
}

/// Jobs are only queued while holding the `workers` lock, so an idle worker
/// that finds its queue empty under that lock can deregister without losing
/// a message.
fn spawn_worker(
	ctx: BridgeContext,
	workers: Workers,
	sender: MatrixUserId,
	cfg: &DispatcherConfig,
) -> mpsc::Sender<MessageJob> {
	let (tx, mut rx) = mpsc::channel::<MessageJob>(cfg.worker_queue_capacity.max(1));
	let idle = cfg.worker_idle_timeout;
	tokio::spawn(async move {
		loop {
			let job = match tokio::time::timeout(idle, rx.recv()).await {
				Ok(Some(job)) => job,
				Ok(None) => break,
				Err(_) => {
					let mut workers = workers.lock();
					match rx.try_recv() {
						Ok(job) => job,
						Err(_) => {
							workers.remove(&sender);
							debug!(%sender, "idle message worker exited");
							break;
						}
					}
				}
			};
			process_message(&ctx, &sender, job).await;
		}
	});
	tx
}

async fn process_message(ctx: &BridgeContext, sender: &MatrixUserId, job: MessageJob) {
	let Some(user) = ctx.registry.lookup_user(sender) else {
		return;
	};
	let Some(link) = ctx.registry.lookup_room(&job.room) else {
		return;
	};
	let creds = user.session_credentials();

	match job.content {
		MessageContent::Text { body } => {
			match ctx.sessions.send(sender, creds.as_ref(), &link.channel, &body).await {
				Ok(SendOutcome::Sent) => debug!(%sender, channel = %link.channel, "relayed message to twitch"),
				Ok(SendOutcome::NotReady) => debug!(%sender, "sender has not linked twitch; dropping message"),
				Err(e) => on_session_error(ctx, sender, e).await,
			}
		}
		MessageContent::Unsupported { msgtype, .. } => {
			if creds.is_none() {
				debug!(%sender, "sender has not linked twitch; dropping message");
				return;
			}
			debug!(%sender, %msgtype, "non-text message; notifying room");

			let name = match ctx.matrix.display_name(sender).await {
				Ok(Some(name)) => name,
				Ok(None) => sender.localpart().to_string(),
				Err(e) => {
					debug!(%sender, error = %e, "display name lookup failed");
					sender.localpart().to_string()
				}
			};
			let notice = format!("{name}: Please use Text only as Twitch doesn't support any other Media Format!");
			if let Err(e) = ctx.matrix.send_notice(&job.room, &notice).await {
				warn!(room = %job.room, error = %e, "failed to post unsupported-content notice");
			}
		}
	}
}

async fn on_session_error(ctx: &BridgeContext, user: &MatrixUserId, err: SessionError) {
	metrics::counter!("mxtwitch_dispatch_failures_total").increment(1);
	if !err.is_auth() {
		warn!(%user, error = %err, "twitch session error; message dropped");
		return;
	}

	warn!(%user, error = %err, "twitch rejected credentials; asking user to log in again");
	if let Some(updated) = ctx.registry.clear_credentials(user)
		&& let Err(e) = ctx.store.save_user(&updated).await
	{
		warn!(%user, error = %e, "failed to persist cleared credentials");
	}
	ctx.sessions.close_owner(user).await;

	if let Err(e) = ctx.login.send_login_url(user).await {
		warn!(%user, error = %e, "failed to send login url");
	}
}
