#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use mxtwitch_domain::TwitchChannel;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use super::irc::{IrcMessage, sanitize_chat_text};
use super::{SessionError, TwitchChat, TwitchConnector, TwitchInbound};
use crate::SecretString;

type TwitchWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// NOTICE msg-ids that mean a JOIN will never succeed.
const JOIN_FAILURE_NOTICES: &[&str] = &["msg_channel_suspended", "msg_banned", "msg_room_not_found", "tos_ban"];

/// Chat connector configuration.
#[derive(Debug, Clone)]
pub struct IrcConnectorConfig {
	pub ws_url: String,
	/// Upper bound for the PASS/NICK handshake.
	pub handshake_timeout: Duration,
	pub outbound_capacity: usize,
}

impl Default for IrcConnectorConfig {
	fn default() -> Self {
		Self {
			ws_url: "wss://irc-ws.chat.twitch.tv:443".to_string(),
			handshake_timeout: Duration::from_secs(10),
			outbound_capacity: 64,
		}
	}
}

/// Twitch chat over IRC-on-WebSocket.
#[derive(Debug, Clone, Default)]
pub struct IrcConnector {
	cfg: IrcConnectorConfig,
}

impl IrcConnector {
	pub fn new(cfg: IrcConnectorConfig) -> Self {
		Self { cfg }
	}
}

#[async_trait]
impl TwitchConnector for IrcConnector {
	async fn connect(&self, token: &SecretString, login: &str) -> Result<Box<dyn TwitchChat>, SessionError> {
		let login = login.trim().to_ascii_lowercase();
		let token = token.expose().trim();
		let token = token.strip_prefix("oauth:").unwrap_or(token);
		if token.is_empty() || login.is_empty() {
			return Err(SessionError::Auth("missing token or login".to_string()));
		}

		let (mut ws, _resp) = tokio_tungstenite::connect_async(self.cfg.ws_url.as_str())
			.await
			.map_err(|e| SessionError::Connect(e.to_string()))?;

		for line in [
			"CAP REQ :twitch.tv/tags twitch.tv/commands".to_string(),
			format!("PASS oauth:{token}"),
			format!("NICK {login}"),
		] {
			ws.send(Message::Text(line.into()))
				.await
				.map_err(|e| SessionError::Connect(e.to_string()))?;
		}

		match tokio::time::timeout(self.cfg.handshake_timeout, read_until_welcome(&mut ws)).await {
			Ok(Ok(())) => {}
			Ok(Err(e)) => {
				let _ = ws.close(None).await;
				return Err(e);
			}
			Err(_) => {
				let _ = ws.close(None).await;
				return Err(SessionError::Timeout { op: "handshake" });
			}
		}

		info!(%login, "twitch chat connected");
		metrics::counter!("mxtwitch_irc_connects_total").increment(1);

		let shared = Arc::new(Shared {
			login,
			pending_joins: Mutex::new(HashMap::new()),
			listener: Mutex::new(None),
			closed: AtomicBool::new(false),
		});
		let (out_tx, out_rx) = mpsc::channel(self.cfg.outbound_capacity.max(1));
		let (done_tx, done_rx) = watch::channel(false);

		tokio::spawn(run_connection(ws, Arc::clone(&shared), out_rx, done_rx));

		Ok(Box::new(IrcChat { shared, out_tx, done_tx }))
	}
}

async fn read_until_welcome(ws: &mut TwitchWs) -> Result<(), SessionError> {
	loop {
		let Some(msg) = ws.next().await else {
			return Err(SessionError::Connect("socket closed before welcome".to_string()));
		};
		let msg = msg.map_err(|e| SessionError::Connect(e.to_string()))?;

		match msg {
			Message::Text(t) => {
				for line in t.as_str().split("\r\n") {
					let Some(irc) = IrcMessage::parse(line) else {
						continue;
					};
					match irc.command.as_str() {
						"001" => return Ok(()),
						"PING" => {
							let pong = format!("PONG :{}", irc.trailing().unwrap_or("tmi.twitch.tv"));
							let _ = ws.send(Message::Text(pong.into())).await;
						}
						"NOTICE" => {
							let text = irc.trailing().unwrap_or_default();
							if is_auth_failure(text) {
								return Err(SessionError::Auth(text.to_string()));
							}
							debug!(notice = %text, "twitch notice during handshake");
						}
						_ => {}
					}
				}
			}
			Message::Ping(p) => {
				let _ = ws.send(Message::Pong(p)).await;
			}
			Message::Close(c) => {
				return Err(SessionError::Connect(format!("socket closed before welcome: {c:?}")));
			}
			_ => {}
		}
	}
}

fn is_auth_failure(notice: &str) -> bool {
	let notice = notice.to_ascii_lowercase();
	notice.contains("login authentication failed") || notice.contains("improperly formatted auth")
}

struct Shared {
	login: String,
	pending_joins: Mutex<HashMap<String, oneshot::Sender<Result<(), SessionError>>>>,
	listener: Mutex<Option<mpsc::Sender<TwitchInbound>>>,
	closed: AtomicBool,
}

impl Shared {
	fn resolve_join(&self, channel: &str, result: Result<(), SessionError>) {
		if let Some(tx) = self.pending_joins.lock().remove(channel) {
			let _ = tx.send(result);
		}
	}

	fn fail_all(&self) {
		let pending: Vec<_> = self.pending_joins.lock().drain().collect();
		for (_, tx) in pending {
			let _ = tx.send(Err(SessionError::Closed));
		}
		self.listener.lock().take();
	}
}

enum LineAction {
	Nothing,
	Reply(String),
	Reconnect,
}

fn handle_line(shared: &Shared, msg: IrcMessage) -> LineAction {
	match msg.command.as_str() {
		"PING" => LineAction::Reply(format!("PONG :{}", msg.trailing().unwrap_or("tmi.twitch.tv"))),
		"RECONNECT" => LineAction::Reconnect,
		"JOIN" => {
			if msg.nick() == Some(shared.login.as_str())
				&& let Some(channel) = msg.param(0)
			{
				shared.resolve_join(channel.trim_start_matches('#'), Ok(()));
			}
			LineAction::Nothing
		}
		"NOTICE" => {
			let text = msg.trailing().unwrap_or_default();
			if let Some(msg_id) = msg.tag("msg-id")
				&& JOIN_FAILURE_NOTICES.contains(&msg_id)
				&& let Some(channel) = msg.param(0)
			{
				let channel = channel.trim_start_matches('#');
				shared.resolve_join(
					channel,
					Err(SessionError::Join {
						channel: channel.to_string(),
						detail: text.to_string(),
					}),
				);
			} else {
				debug!(login = %shared.login, notice = %text, "twitch notice");
			}
			LineAction::Nothing
		}
		"PRIVMSG" => {
			let (Some(target), Some(nick), Some(text)) = (msg.param(0), msg.nick(), msg.trailing()) else {
				return LineAction::Nothing;
			};
			let Ok(channel) = TwitchChannel::new(target) else {
				return LineAction::Nothing;
			};
			let inbound = TwitchInbound {
				channel,
				login: nick.to_string(),
				display_name: msg.tag("display-name").map(str::to_string),
				text: text.to_string(),
			};
			if let Some(tx) = shared.listener.lock().as_ref()
				&& tx.try_send(inbound).is_err()
			{
				metrics::counter!("mxtwitch_irc_inbound_dropped_total").increment(1);
			}
			LineAction::Nothing
		}
		_ => LineAction::Nothing,
	}
}

async fn run_connection(
	ws: TwitchWs,
	shared: Arc<Shared>,
	mut out_rx: mpsc::Receiver<String>,
	mut done_rx: watch::Receiver<bool>,
) {
	let (mut sink, mut stream) = ws.split();

	loop {
		tokio::select! {
			line = out_rx.recv() => {
				let Some(line) = line else {
					break;
				};
				if let Err(e) = sink.send(Message::Text(line.into())).await {
					warn!(login = %shared.login, error = %e, "twitch write failed");
					break;
				}
			}

			msg = stream.next() => {
				let msg = match msg {
					Some(Ok(m)) => m,
					Some(Err(e)) => {
						warn!(login = %shared.login, error = %e, "twitch read failed");
						break;
					}
					None => break,
				};

				match msg {
					Message::Text(t) => {
						let mut reconnect = false;
						for line in t.as_str().split("\r\n") {
							let Some(irc) = IrcMessage::parse(line) else {
								continue;
							};
							match handle_line(&shared, irc) {
								LineAction::Nothing => {}
								LineAction::Reply(reply) => {
									let _ = sink.send(Message::Text(reply.into())).await;
								}
								LineAction::Reconnect => reconnect = true,
							}
						}
						if reconnect {
							info!(login = %shared.login, "twitch requested reconnect; closing session");
							break;
						}
					}
					Message::Ping(p) => {
						let _ = sink.send(Message::Pong(p)).await;
					}
					Message::Close(c) => {
						debug!(login = %shared.login, close = ?c, "twitch closed socket");
						break;
					}
					_ => {}
				}
			}

			_ = done_rx.changed() => {
				break;
			}
		}
	}

	shared.closed.store(true, Ordering::Release);
	shared.fail_all();
	let _ = sink.close().await;
	debug!(login = %shared.login, "twitch connection task exited");
}

struct IrcChat {
	shared: Arc<Shared>,
	out_tx: mpsc::Sender<String>,
	done_tx: watch::Sender<bool>,
}

impl IrcChat {
	async fn write(&self, line: String) -> Result<(), SessionError> {
		if self.is_closed() {
			return Err(SessionError::Closed);
		}
		self.out_tx.send(line).await.map_err(|_| SessionError::Closed)
	}
}

#[async_trait]
impl TwitchChat for IrcChat {
	async fn join(&self, channel: &TwitchChannel) -> Result<(), SessionError> {
		let (tx, rx) = oneshot::channel();
		self.shared.pending_joins.lock().insert(channel.as_str().to_string(), tx);
		self.write(IrcMessage::new("JOIN", vec![channel.irc_name()]).to_string())
			.await?;
		rx.await.unwrap_or(Err(SessionError::Closed))
	}

	async fn send(&self, channel: &TwitchChannel, body: &str) -> Result<(), SessionError> {
		let text = sanitize_chat_text(body);
		if text.is_empty() {
			return Err(SessionError::Send("empty message".to_string()));
		}
		self.write(IrcMessage::new("PRIVMSG", vec![channel.irc_name(), text]).to_string())
			.await
	}

	fn listen(&self, tx: mpsc::Sender<TwitchInbound>) {
		*self.shared.listener.lock() = Some(tx);
	}

	async fn close(&self) {
		self.shared.closed.store(true, Ordering::Release);
		let _ = self.done_tx.send(true);
	}

	fn is_closed(&self) -> bool {
		self.shared.closed.load(Ordering::Acquire)
	}
}
