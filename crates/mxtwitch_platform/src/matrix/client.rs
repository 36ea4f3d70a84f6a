#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use mxtwitch_domain::{MatrixRoomId, MatrixUserId};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};
use url::Url;

use super::{MatrixApi, MatrixError};
use crate::SecretString;

const CLIENT_PREFIX: &str = "/_matrix/client/v3";

/// Home server connection settings for the appservice.
#[derive(Debug, Clone)]
pub struct HomeserverConfig {
	pub base_url: String,
	pub as_token: SecretString,
	/// The bridge bot; requests without an explicit `user_id` act as this user.
	pub bot: MatrixUserId,
}

/// Matrix client-server API client authenticated with the appservice token.
#[derive(Debug)]
pub struct HomeserverClient {
	http: reqwest::Client,
	cfg: HomeserverConfig,
	txn_prefix: String,
	txn_counter: AtomicU64,
	direct_rooms: Mutex<HashMap<MatrixUserId, MatrixRoomId>>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
	#[serde(default)]
	errcode: String,
	#[serde(default)]
	error: String,
}

#[derive(Debug, Deserialize)]
struct DisplayNameBody {
	#[serde(default)]
	displayname: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateRoomBody {
	room_id: String,
}

impl HomeserverClient {
	pub fn new(cfg: HomeserverConfig) -> Result<Self, MatrixError> {
		let http = reqwest::Client::builder().user_agent("mxtwitch/0.x (appservice)").build()?;
		Ok(Self {
			http,
			cfg,
			txn_prefix: uuid::Uuid::new_v4().simple().to_string(),
			txn_counter: AtomicU64::new(0),
			direct_rooms: Mutex::new(HashMap::new()),
		})
	}

	fn url(&self, path: &str, as_user: Option<&MatrixUserId>) -> Result<Url, MatrixError> {
		let base = self.cfg.base_url.trim_end_matches('/');
		let mut url = Url::parse(&format!("{base}{CLIENT_PREFIX}{path}"))?;
		let user = as_user.unwrap_or(&self.cfg.bot);
		url.query_pairs_mut().append_pair("user_id", user.as_str());
		Ok(url)
	}

	fn next_txn_id(&self) -> String {
		let n = self.txn_counter.fetch_add(1, Ordering::Relaxed);
		format!("{}-{n}", self.txn_prefix)
	}

	async fn execute(&self, req: reqwest::RequestBuilder) -> Result<String, MatrixError> {
		let resp = req.bearer_auth(self.cfg.as_token.expose()).send().await?;
		let status = resp.status();
		let body = resp.text().await?;
		if status.is_success() {
			return Ok(body);
		}

		let parsed: ErrorBody = serde_json::from_str(&body).unwrap_or(ErrorBody {
			errcode: String::new(),
			error: body,
		});
		Err(MatrixError::Api {
			status: status.as_u16(),
			errcode: parsed.errcode,
			error: parsed.error,
		})
	}

	async fn send_message(
		&self,
		as_user: Option<&MatrixUserId>,
		room: &MatrixRoomId,
		msgtype: &str,
		text: &str,
	) -> Result<(), MatrixError> {
		let path = format!(
			"/rooms/{}/send/m.room.message/{}",
			urlencoding::encode(room.as_str()),
			self.next_txn_id()
		);
		let url = self.url(&path, as_user)?;
		self.execute(self.http.put(url).json(&json!({ "msgtype": msgtype, "body": text })))
			.await?;
		Ok(())
	}

	async fn direct_room_for(&self, user: &MatrixUserId) -> Result<MatrixRoomId, MatrixError> {
		if let Some(room) = self.direct_rooms.lock().get(user).cloned() {
			return Ok(room);
		}

		let url = self.url("/createRoom", None)?;
		let body = self
			.execute(self.http.post(url).json(&json!({
				"is_direct": true,
				"preset": "trusted_private_chat",
				"invite": [user.as_str()],
				"name": "Twitch bridge",
			})))
			.await?;
		let created: CreateRoomBody =
			serde_json::from_str(&body).map_err(|e| MatrixError::InvalidResponse(format!("createRoom: {e}")))?;
		let room = MatrixRoomId::new(created.room_id)
			.map_err(|e| MatrixError::InvalidResponse(format!("createRoom room_id: {e}")))?;

		info!(user = %user, room = %room, "created direct room");
		let room = self.direct_rooms.lock().entry(user.clone()).or_insert(room).clone();
		Ok(room)
	}
}

#[async_trait]
impl MatrixApi for HomeserverClient {
	async fn display_name(&self, user: &MatrixUserId) -> Result<Option<String>, MatrixError> {
		let path = format!("/profile/{}/displayname", urlencoding::encode(user.as_str()));
		let url = self.url(&path, None)?;
		match self.execute(self.http.get(url)).await {
			Ok(body) => {
				let parsed: DisplayNameBody = serde_json::from_str(&body)
					.map_err(|e| MatrixError::InvalidResponse(format!("displayname: {e}")))?;
				Ok(parsed.displayname.filter(|n| !n.trim().is_empty()))
			}
			Err(MatrixError::Api { status: 404, .. }) => Ok(None),
			Err(e) => Err(e),
		}
	}

	async fn send_notice(&self, room: &MatrixRoomId, text: &str) -> Result<(), MatrixError> {
		self.send_message(None, room, "m.notice", text).await
	}

	async fn notify_user(&self, user: &MatrixUserId, text: &str) -> Result<(), MatrixError> {
		let room = self.direct_room_for(user).await?;
		self.send_message(None, &room, "m.notice", text).await
	}

	async fn ensure_puppet(&self, localpart: &str) -> Result<(), MatrixError> {
		let url = self.url("/register", None)?;
		let req = self.http.post(url).json(&json!({
			"type": "m.login.application_service",
			"username": localpart,
			"inhibit_login": true,
		}));
		match self.execute(req).await {
			Ok(_) => {
				debug!(%localpart, "registered puppet");
				Ok(())
			}
			Err(e) if e.errcode() == Some("M_USER_IN_USE") => Ok(()),
			Err(e) => Err(e),
		}
	}

	async fn set_display_name_as(&self, user: &MatrixUserId, name: &str) -> Result<(), MatrixError> {
		let path = format!("/profile/{}/displayname", urlencoding::encode(user.as_str()));
		let url = self.url(&path, Some(user))?;
		self.execute(self.http.put(url).json(&json!({ "displayname": name })))
			.await?;
		Ok(())
	}

	async fn join_room_as(&self, user: &MatrixUserId, room: &MatrixRoomId) -> Result<(), MatrixError> {
		let path = format!("/join/{}", urlencoding::encode(room.as_str()));
		let url = self.url(&path, Some(user))?;
		self.execute(self.http.post(url).json(&json!({}))).await?;
		Ok(())
	}

	async fn send_text_as(&self, user: &MatrixUserId, room: &MatrixRoomId, text: &str) -> Result<(), MatrixError> {
		self.send_message(Some(user), room, "m.text", text).await
	}
}
