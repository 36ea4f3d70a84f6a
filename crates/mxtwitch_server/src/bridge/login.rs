#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mxtwitch_domain::MatrixUserId;
use mxtwitch_platform::matrix::{MatrixApi, MatrixError};
use mxtwitch_platform::twitch::{OAuthConfig, OAuthError, TwitchOAuth, authorize_url};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::registry::SessionRegistry;
use super::session::SessionManager;
use super::store::BridgeStore;

#[derive(Debug, Clone)]
pub struct LoginConfig {
	/// How long an issued authorization URL stays redeemable.
	pub state_ttl: Duration,
	/// No new URL is issued while one younger than this is outstanding.
	pub resend_cooldown: Duration,
}

impl Default for LoginConfig {
	fn default() -> Self {
		Self {
			state_ttl: Duration::from_secs(600),
			resend_cooldown: Duration::from_secs(30),
		}
	}
}

#[derive(Debug, Error)]
pub enum LoginError {
	#[error("authorization declined by twitch: {0}")]
	Denied(String),
	#[error("unknown or expired login state")]
	InvalidState,
	#[error("callback carried no authorization code")]
	MissingCode,
	#[error("token exchange failed: {0}")]
	Exchange(#[from] OAuthError),
	#[error("could not build authorization url: {0}")]
	Url(String),
	#[error("could not deliver login url: {0}")]
	Delivery(#[from] MatrixError),
}

/// Query parameters of the OAuth redirect.
#[derive(Debug, Clone, Default)]
pub struct CallbackParams {
	pub code: Option<String>,
	pub state: Option<String>,
	pub error: Option<String>,
	pub error_description: Option<String>,
}

impl CallbackParams {
	pub fn from_query(query: &str) -> Self {
		let mut out = Self::default();
		for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
			let v = Some(v.into_owned()).filter(|v| !v.trim().is_empty());
			match k.as_ref() {
				"code" => out.code = v,
				"state" => out.state = v,
				"error" => out.error = v,
				"error_description" => out.error_description = v,
				_ => {}
			}
		}
		out
	}
}

/// Result of a completed login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedAccount {
	pub user: MatrixUserId,
	pub twitch_login: String,
}

#[derive(Debug)]
struct PendingLogin {
	user: MatrixUserId,
	issued_at: Instant,
}

/// Issues one-time authorization URLs and redeems them on callback.
pub struct LoginFlow {
	oauth: Arc<dyn TwitchOAuth>,
	oauth_cfg: OAuthConfig,
	matrix: Arc<dyn MatrixApi>,
	registry: Arc<SessionRegistry>,
	store: Arc<dyn BridgeStore>,
	sessions: Arc<SessionManager>,
	cfg: LoginConfig,
	pending: Mutex<HashMap<String, PendingLogin>>,
}

impl LoginFlow {
	pub fn new(
		oauth: Arc<dyn TwitchOAuth>,
		oauth_cfg: OAuthConfig,
		matrix: Arc<dyn MatrixApi>,
		registry: Arc<SessionRegistry>,
		store: Arc<dyn BridgeStore>,
		sessions: Arc<SessionManager>,
		cfg: LoginConfig,
	) -> Self {
		Self {
			oauth,
			oauth_cfg,
			matrix,
			registry,
			store,
			sessions,
			cfg,
			pending: Mutex::new(HashMap::new()),
		}
	}

	/// Reserve a fresh state nonce for `user`, or `None` if a recent one is
	/// still outstanding.
	fn reserve_state(&self, user: &MatrixUserId) -> Option<String> {
		let now = Instant::now();
		let mut pending = self.pending.lock();
		pending.retain(|_, p| now.duration_since(p.issued_at) < self.cfg.state_ttl);

		let recent = pending
			.values()
			.any(|p| &p.user == user && now.duration_since(p.issued_at) < self.cfg.resend_cooldown);
		if recent {
			return None;
		}

		let state = Uuid::new_v4().simple().to_string();
		pending.insert(
			state.clone(),
			PendingLogin {
				user: user.clone(),
				issued_at: now,
			},
		);
		Some(state)
	}

	fn take_state(&self, state: &str) -> Option<MatrixUserId> {
		let p = self.pending.lock().remove(state)?;
		(p.issued_at.elapsed() < self.cfg.state_ttl).then_some(p.user)
	}

	/// Deliver an authorization URL to `user`. Returns `false` when delivery
	/// was suppressed because a URL was sent moments ago.
	pub async fn send_login_url(&self, user: &MatrixUserId) -> Result<bool, LoginError> {
		let Some(state) = self.reserve_state(user) else {
			debug!(%user, "login url recently sent; not resending");
			return Ok(false);
		};

		let url = match authorize_url(&self.oauth_cfg, &state) {
			Ok(url) => url,
			Err(e) => {
				self.pending.lock().remove(&state);
				return Err(LoginError::Url(e.to_string()));
			}
		};

		let text = format!(
			"To relay your messages to Twitch, link your Twitch account by opening this link: {url}"
		);
		if let Err(e) = self.matrix.notify_user(user, &text).await {
			self.pending.lock().remove(&state);
			return Err(e.into());
		}

		metrics::counter!("mxtwitch_login_urls_sent_total").increment(1);
		info!(%user, "sent twitch login url");
		Ok(true)
	}

	/// Redeem an OAuth redirect.
	pub async fn handle_callback(&self, params: CallbackParams) -> Result<LinkedAccount, LoginError> {
		if let Some(error) = params.error {
			if let Some(state) = params.state.as_deref() {
				self.take_state(state);
			}
			let detail = params.error_description.unwrap_or(error);
			return Err(LoginError::Denied(detail));
		}

		let user = params
			.state
			.as_deref()
			.and_then(|s| self.take_state(s))
			.ok_or(LoginError::InvalidState)?;
		let code = params.code.ok_or(LoginError::MissingCode)?;

		let token = self.oauth.exchange_code(&code).await?;
		let validation = self.oauth.validate(&token.access_token).await?;

		let updated = self
			.registry
			.set_credentials(&user, &validation.login, token.access_token, token.refresh_token);
		// Sessions opened with an earlier token are stale now.
		self.sessions.close_owner(&user).await;

		if let Err(e) = self.store.save_user(&updated).await {
			warn!(%user, error = %e, "failed to persist twitch credentials");
		}

		metrics::counter!("mxtwitch_logins_completed_total").increment(1);
		info!(%user, twitch_login = %validation.login, "twitch account linked");

		let text = format!(
			"Your Twitch account {} is now linked. Messages you send in bridged rooms will be relayed.",
			validation.login
		);
		if let Err(e) = self.matrix.notify_user(&user, &text).await {
			debug!(%user, error = %e, "could not confirm login to user");
		}

		Ok(LinkedAccount {
			user,
			twitch_login: validation.login,
		})
	}

	#[cfg(test)]
	pub(crate) fn pending_count(&self) -> usize {
		self.pending.lock().len()
	}
}
