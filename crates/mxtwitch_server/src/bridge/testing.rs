#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use mxtwitch_domain::{MatrixRoomId, MatrixUserId, TwitchChannel};
use mxtwitch_platform::SecretString;
use mxtwitch_platform::matrix::{BridgeEvent, EventKind, MatrixApi, MatrixError, Membership, MessageContent};
use mxtwitch_platform::twitch::{
	OAuthConfig, OAuthError, SessionError, TwitchChat, TwitchConnector, TwitchInbound, TwitchOAuth, TwitchToken,
	TwitchTokenValidation,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::BridgeContext;
use super::login::{LoginConfig, LoginFlow};
use super::model::{AsUser, BotUser, RealUser, RoomLink};
use super::registry::SessionRegistry;
use super::session::{SessionConfig, SessionManager};
use super::store::BridgeStore;

pub const BOT: &str = "@twitchbot:example.org";
pub const BOT_TWITCH: &str = "bridgebot";
pub const ROOM: &str = "!r1:example.org";
pub const CHANNEL: &str = "chan1";

pub fn uid(s: &str) -> MatrixUserId {
	MatrixUserId::new(s).expect("valid user id")
}

pub fn rid(s: &str) -> MatrixRoomId {
	MatrixRoomId::new(s).expect("valid room id")
}

pub fn chan(s: &str) -> TwitchChannel {
	TwitchChannel::new(s).expect("valid channel")
}

pub fn join_event(user: &str, room: &str) -> BridgeEvent {
	BridgeEvent {
		event_id: None,
		sender: uid(user),
		room_id: rid(room),
		kind: EventKind::Membership {
			target: uid(user),
			membership: Membership::Join,
		},
	}
}

pub fn text_event(user: &str, room: &str, body: &str) -> BridgeEvent {
	BridgeEvent {
		event_id: None,
		sender: uid(user),
		room_id: rid(room),
		kind: EventKind::Message(MessageContent::Text { body: body.to_string() }),
	}
}

pub fn image_event(user: &str, room: &str) -> BridgeEvent {
	BridgeEvent {
		event_id: None,
		sender: uid(user),
		room_id: rid(room),
		kind: EventKind::Message(MessageContent::Unsupported {
			msgtype: "m.image".to_string(),
			body: Some("cat.png".to_string()),
		}),
	}
}

/// Poll `cond` until it holds; panics after two seconds.
pub async fn wait_for(what: &str, cond: impl Fn() -> bool) {
	let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
	while !cond() {
		if tokio::time::Instant::now() > deadline {
			panic!("timed out waiting for {what}");
		}
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
}

/// Give spawned tasks a chance to run, for asserting that nothing happens.
pub async fn settle() {
	tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Extract the `state` query parameter from a login message.
pub fn state_from_message(text: &str) -> String {
	let start = text.find("state=").expect("message carries a state") + "state=".len();
	text[start..].split(['&', ' ']).next().unwrap_or_default().to_string()
}

// twitch

/// Records what the bridge does against Twitch.
#[derive(Default)]
pub struct FakeTwitch {
	pub connects: Mutex<Vec<String>>,
	pub joins: Mutex<Vec<(String, TwitchChannel)>>,
	pub sends: Mutex<Vec<(String, TwitchChannel, String)>>,
	pub closes: AtomicUsize,
	pub connect_error: Mutex<Option<SessionError>>,
	pub join_error: Mutex<Option<SessionError>>,
	pub send_error: Mutex<Option<SessionError>>,
	pub connect_delay: Mutex<Option<Duration>>,
	listeners: Mutex<Vec<mpsc::Sender<TwitchInbound>>>,
	closed_flags: Mutex<Vec<Arc<AtomicBool>>>,
}

impl FakeTwitch {
	pub fn connect_count(&self) -> usize {
		self.connects.lock().len()
	}

	pub fn join_count(&self) -> usize {
		self.joins.lock().len()
	}

	pub fn sends(&self) -> Vec<(String, TwitchChannel, String)> {
		self.sends.lock().clone()
	}

	pub fn listener_count(&self) -> usize {
		self.listeners.lock().len()
	}

	/// Simulate the remote end dropping every connection.
	pub fn drop_all_connections(&self) {
		for flag in self.closed_flags.lock().iter() {
			flag.store(true, Ordering::Release);
		}
	}

	pub async fn push_inbound(&self, msg: TwitchInbound) {
		let listeners = self.listeners.lock().clone();
		for tx in listeners {
			let _ = tx.send(msg.clone()).await;
		}
	}
}

pub struct FakeConnector(pub Arc<FakeTwitch>);

#[async_trait]
impl TwitchConnector for FakeConnector {
	async fn connect(&self, token: &SecretString, login: &str) -> Result<Box<dyn TwitchChat>, SessionError> {
		let delay = *self.0.connect_delay.lock();
		if let Some(delay) = delay {
			tokio::time::sleep(delay).await;
		}
		let err = self.0.connect_error.lock().clone();
		if let Some(err) = err {
			return Err(err);
		}
		assert!(!token.is_blank(), "connect without a token");
		self.0.connects.lock().push(login.to_string());

		let closed = Arc::new(AtomicBool::new(false));
		self.0.closed_flags.lock().push(Arc::clone(&closed));
		Ok(Box::new(FakeChat {
			login: login.to_string(),
			twitch: Arc::clone(&self.0),
			closed,
		}))
	}
}

struct FakeChat {
	login: String,
	twitch: Arc<FakeTwitch>,
	closed: Arc<AtomicBool>,
}

#[async_trait]
impl TwitchChat for FakeChat {
	async fn join(&self, channel: &TwitchChannel) -> Result<(), SessionError> {
		let err = self.twitch.join_error.lock().clone();
		if let Some(err) = err {
			return Err(err);
		}
		self.twitch.joins.lock().push((self.login.clone(), channel.clone()));
		Ok(())
	}

	async fn send(&self, channel: &TwitchChannel, body: &str) -> Result<(), SessionError> {
		if self.is_closed() {
			return Err(SessionError::Closed);
		}
		let err = self.twitch.send_error.lock().clone();
		if let Some(err) = err {
			return Err(err);
		}
		self.twitch
			.sends
			.lock()
			.push((self.login.clone(), channel.clone(), body.to_string()));
		Ok(())
	}

	fn listen(&self, tx: mpsc::Sender<TwitchInbound>) {
		self.twitch.listeners.lock().push(tx);
	}

	async fn close(&self) {
		if !self.closed.swap(true, Ordering::AcqRel) {
			self.twitch.closes.fetch_add(1, Ordering::Relaxed);
		}
	}

	fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}
}

// matrix

#[derive(Default)]
pub struct FakeMatrix {
	pub display_names: Mutex<HashMap<MatrixUserId, String>>,
	pub notices: Mutex<Vec<(MatrixRoomId, String)>>,
	pub direct: Mutex<Vec<(MatrixUserId, String)>>,
	pub puppets: Mutex<Vec<String>>,
	pub puppet_names: Mutex<Vec<(MatrixUserId, String)>>,
	pub room_joins: Mutex<Vec<(MatrixUserId, MatrixRoomId)>>,
	pub posted: Mutex<Vec<(MatrixUserId, MatrixRoomId, String)>>,
	pub fail_notify: AtomicBool,
	pub fail_post: AtomicBool,
}

impl FakeMatrix {
	pub fn direct_to(&self, user: &str) -> Vec<String> {
		let user = uid(user);
		self.direct
			.lock()
			.iter()
			.filter(|(u, _)| *u == user)
			.map(|(_, text)| text.clone())
			.collect()
	}

	/// Login URLs delivered to `user`.
	pub fn login_urls_to(&self, user: &str) -> Vec<String> {
		self.direct_to(user).into_iter().filter(|t| t.contains("state=")).collect()
	}

	pub fn notices(&self) -> Vec<(MatrixRoomId, String)> {
		self.notices.lock().clone()
	}

	pub fn posted(&self) -> Vec<(MatrixUserId, MatrixRoomId, String)> {
		self.posted.lock().clone()
	}
}

fn api_error(errcode: &str) -> MatrixError {
	MatrixError::Api {
		status: 500,
		errcode: errcode.to_string(),
		error: "fake failure".to_string(),
	}
}

#[async_trait]
impl MatrixApi for FakeMatrix {
	async fn display_name(&self, user: &MatrixUserId) -> Result<Option<String>, MatrixError> {
		Ok(self.display_names.lock().get(user).cloned())
	}

	async fn send_notice(&self, room: &MatrixRoomId, text: &str) -> Result<(), MatrixError> {
		self.notices.lock().push((room.clone(), text.to_string()));
		Ok(())
	}

	async fn notify_user(&self, user: &MatrixUserId, text: &str) -> Result<(), MatrixError> {
		if self.fail_notify.load(Ordering::Relaxed) {
			return Err(api_error("M_UNKNOWN"));
		}
		self.direct.lock().push((user.clone(), text.to_string()));
		Ok(())
	}

	async fn ensure_puppet(&self, localpart: &str) -> Result<(), MatrixError> {
		self.puppets.lock().push(localpart.to_string());
		Ok(())
	}

	async fn set_display_name_as(&self, user: &MatrixUserId, name: &str) -> Result<(), MatrixError> {
		self.puppet_names.lock().push((user.clone(), name.to_string()));
		Ok(())
	}

	async fn join_room_as(&self, user: &MatrixUserId, room: &MatrixRoomId) -> Result<(), MatrixError> {
		self.room_joins.lock().push((user.clone(), room.clone()));
		Ok(())
	}

	async fn send_text_as(&self, user: &MatrixUserId, room: &MatrixRoomId, text: &str) -> Result<(), MatrixError> {
		if self.fail_post.load(Ordering::Relaxed) {
			return Err(api_error("M_FORBIDDEN"));
		}
		self.posted.lock().push((user.clone(), room.clone(), text.to_string()));
		Ok(())
	}
}

// oauth

/// Accepts the code `good`; tokens validate as `twitch_login`.
pub struct FakeOAuth {
	pub twitch_login: Mutex<String>,
	pub exchanges: AtomicUsize,
}

impl FakeOAuth {
	pub fn new(twitch_login: &str) -> Self {
		Self {
			twitch_login: Mutex::new(twitch_login.to_string()),
			exchanges: AtomicUsize::new(0),
		}
	}
}

#[async_trait]
impl TwitchOAuth for FakeOAuth {
	async fn exchange_code(&self, code: &str) -> Result<TwitchToken, OAuthError> {
		self.exchanges.fetch_add(1, Ordering::Relaxed);
		if code != "good" {
			return Err(OAuthError::Rejected {
				status: 400,
				body: "Invalid authorization code".to_string(),
			});
		}
		Ok(TwitchToken {
			access_token: SecretString::new(format!("tok-{code}")),
			refresh_token: Some(SecretString::new("refresh")),
			expires_in: Some(3600),
		})
	}

	async fn validate(&self, _access_token: &SecretString) -> Result<TwitchTokenValidation, OAuthError> {
		Ok(TwitchTokenValidation {
			client_id: "cid".to_string(),
			login: self.twitch_login.lock().clone(),
			user_id: "1".to_string(),
			expires_in: 3600,
			scopes: vec!["chat:read".to_string(), "chat:edit".to_string()],
		})
	}
}

// store

#[derive(Default)]
pub struct MemoryStore {
	pub rooms: Mutex<Vec<RoomLink>>,
	pub users: Mutex<HashMap<MatrixUserId, RealUser>>,
	pub puppets: Mutex<HashMap<MatrixUserId, AsUser>>,
	pub bot: Mutex<Option<BotUser>>,
	pub user_saves: AtomicUsize,
	pub fail_saves: AtomicBool,
}

impl MemoryStore {
	pub fn saved_user(&self, mxid: &str) -> Option<RealUser> {
		self.users.lock().get(&uid(mxid)).cloned()
	}

	fn check(&self) -> anyhow::Result<()> {
		if self.fail_saves.load(Ordering::Relaxed) {
			anyhow::bail!("disk full");
		}
		Ok(())
	}
}

#[async_trait]
impl BridgeStore for MemoryStore {
	async fn load_room_links(&self) -> anyhow::Result<Vec<RoomLink>> {
		Ok(self.rooms.lock().clone())
	}

	async fn load_real_users(&self) -> anyhow::Result<Vec<RealUser>> {
		Ok(self.users.lock().values().cloned().collect())
	}

	async fn load_as_users(&self) -> anyhow::Result<Vec<AsUser>> {
		Ok(self.puppets.lock().values().cloned().collect())
	}

	async fn load_bot_user(&self) -> anyhow::Result<Option<BotUser>> {
		Ok(self.bot.lock().clone())
	}

	async fn save_user(&self, user: &RealUser) -> anyhow::Result<()> {
		self.check()?;
		self.user_saves.fetch_add(1, Ordering::Relaxed);
		self.users.lock().insert(user.mxid.clone(), user.clone());
		Ok(())
	}

	async fn save_as_user(&self, user: &AsUser) -> anyhow::Result<()> {
		self.check()?;
		self.puppets.lock().insert(user.mxid.clone(), user.clone());
		Ok(())
	}

	async fn save_room_link(&self, link: &RoomLink) -> anyhow::Result<()> {
		self.check()?;
		let mut rooms = self.rooms.lock();
		rooms.retain(|r| r.room_id != link.room_id);
		rooms.push(link.clone());
		Ok(())
	}

	async fn save_bot_user(&self, bot: &BotUser) -> anyhow::Result<()> {
		self.check()?;
		*self.bot.lock() = Some(bot.clone());
		Ok(())
	}
}

// wiring

pub fn bot_user() -> BotUser {
	BotUser {
		mxid: uid(BOT),
		twitch_name: BOT_TWITCH.to_string(),
		access_token: SecretString::new("bot-token"),
	}
}

pub fn room_link() -> RoomLink {
	RoomLink {
		room_id: rid(ROOM),
		channel: chan(CHANNEL),
	}
}

/// A bridge wired to fakes: bot `@twitchbot`, room `!r1` bound to `#chan1`.
pub struct Harness {
	pub ctx: BridgeContext,
	pub twitch: Arc<FakeTwitch>,
	pub matrix: Arc<FakeMatrix>,
	pub oauth: Arc<FakeOAuth>,
	pub store: Arc<MemoryStore>,
}

impl Harness {
	pub fn new() -> Self {
		Self::with_config(SessionConfig::default(), LoginConfig::default())
	}

	pub fn with_config(session_cfg: SessionConfig, login_cfg: LoginConfig) -> Self {
		let twitch = Arc::new(FakeTwitch::default());
		let matrix = Arc::new(FakeMatrix::default());
		let oauth = Arc::new(FakeOAuth::new("alice_tv"));
		let store = Arc::new(MemoryStore::default());

		let registry = Arc::new(SessionRegistry::new(bot_user(), vec![room_link()], Vec::new(), Vec::new()));
		let sessions = Arc::new(SessionManager::new(
			Arc::new(FakeConnector(Arc::clone(&twitch))),
			session_cfg,
		));
		let oauth_cfg = OAuthConfig::new("cid", SecretString::new("secret"), "https://bridge.example.org/callback");
		let login = Arc::new(LoginFlow::new(
			oauth.clone(),
			oauth_cfg,
			matrix.clone(),
			Arc::clone(&registry),
			store.clone(),
			Arc::clone(&sessions),
			login_cfg,
		));

		let ctx = BridgeContext {
			registry,
			sessions,
			login,
			matrix: matrix.clone(),
			store: store.clone(),
		};
		Self {
			ctx,
			twitch,
			matrix,
			oauth,
			store,
		}
	}

	/// Give `user` working Twitch credentials directly.
	pub fn authenticate(&self, user: &str, twitch_login: &str) {
		self.ctx
			.registry
			.set_credentials(&uid(user), twitch_login, SecretString::new("user-token"), None);
	}
}
