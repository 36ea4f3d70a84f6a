#![forbid(unsafe_code)]

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::SecretString;

/// Scopes needed to read and write chat over IRC.
pub const DEFAULT_SCOPES: &[&str] = &["chat:read", "chat:edit"];

const AUTHORIZE_PATH: &str = "/oauth2/authorize";
const TOKEN_PATH: &str = "/oauth2/token";
const VALIDATE_PATH: &str = "/oauth2/validate";

#[derive(Debug, Error)]
pub enum OAuthError {
	#[error("twitch oauth request failed: {0}")]
	Http(#[from] reqwest::Error),
	#[error("twitch oauth rejected request: status={status} body={body}")]
	Rejected { status: u16, body: String },
	#[error("twitch oauth response invalid: {0}")]
	InvalidResponse(String),
	#[error("invalid oauth url: {0}")]
	Url(#[from] url::ParseError),
}

/// Token obtained from the authorization-code exchange.
#[derive(Clone, Deserialize)]
pub struct TwitchToken {
	pub access_token: SecretString,
	#[serde(default)]
	pub refresh_token: Option<SecretString>,
	#[serde(default)]
	pub expires_in: Option<u64>,
}

impl std::fmt::Debug for TwitchToken {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TwitchToken")
			.field("access_token", &self.access_token)
			.field("expires_in", &self.expires_in)
			.finish_non_exhaustive()
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct TwitchTokenValidation {
	pub client_id: String,
	pub login: String,
	pub user_id: String,
	pub expires_in: u64,
	#[serde(default)]
	pub scopes: Vec<String>,
}

/// Twitch OAuth application settings.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
	pub client_id: String,
	pub client_secret: SecretString,
	pub redirect_uri: String,
	pub base_url: String,
	pub scopes: Vec<String>,
}

impl OAuthConfig {
	pub fn new(client_id: impl Into<String>, client_secret: SecretString, redirect_uri: impl Into<String>) -> Self {
		Self {
			client_id: client_id.into(),
			client_secret,
			redirect_uri: redirect_uri.into(),
			base_url: "https://id.twitch.tv".to_string(),
			scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
		}
	}
}

/// Build the user-facing authorization URL. `state` is echoed back to the
/// redirect URI untouched.
pub fn authorize_url(cfg: &OAuthConfig, state: &str) -> Result<Url, OAuthError> {
	let mut url = Url::parse(&cfg.base_url)?.join(AUTHORIZE_PATH)?;
	url.query_pairs_mut()
		.append_pair("response_type", "code")
		.append_pair("client_id", &cfg.client_id)
		.append_pair("redirect_uri", &cfg.redirect_uri)
		.append_pair("scope", &cfg.scopes.join(" "))
		.append_pair("force_verify", "true")
		.append_pair("state", state);
	Ok(url)
}

/// Code exchange and token introspection.
#[async_trait]
pub trait TwitchOAuth: Send + Sync + 'static {
	async fn exchange_code(&self, code: &str) -> Result<TwitchToken, OAuthError>;

	async fn validate(&self, access_token: &SecretString) -> Result<TwitchTokenValidation, OAuthError>;
}

#[derive(Debug, Clone)]
pub struct OAuthClient {
	http: reqwest::Client,
	cfg: OAuthConfig,
}

impl OAuthClient {
	pub fn new(cfg: OAuthConfig) -> Result<Self, OAuthError> {
		let http = reqwest::Client::builder().user_agent("mxtwitch/0.x (oauth)").build()?;
		Ok(Self { http, cfg })
	}

	pub fn config(&self) -> &OAuthConfig {
		&self.cfg
	}

	fn url(&self, path: &str) -> Result<Url, OAuthError> {
		Ok(Url::parse(&self.cfg.base_url)?.join(path)?)
	}
}

#[async_trait]
impl TwitchOAuth for OAuthClient {
	async fn exchange_code(&self, code: &str) -> Result<TwitchToken, OAuthError> {
		let resp = self
			.http
			.post(self.url(TOKEN_PATH)?)
			.form(&[
				("grant_type", "authorization_code"),
				("client_id", self.cfg.client_id.as_str()),
				("client_secret", self.cfg.client_secret.expose()),
				("code", code),
				("redirect_uri", self.cfg.redirect_uri.as_str()),
			])
			.send()
			.await?;

		let status = resp.status();
		let body = resp.text().await?;
		if !status.is_success() {
			return Err(OAuthError::Rejected {
				status: status.as_u16(),
				body,
			});
		}

		let token: TwitchToken =
			serde_json::from_str(&body).map_err(|e| OAuthError::InvalidResponse(format!("token exchange: {e}")))?;
		if token.access_token.expose().trim().is_empty() {
			return Err(OAuthError::InvalidResponse("empty access_token".to_string()));
		}
		Ok(token)
	}

	async fn validate(&self, access_token: &SecretString) -> Result<TwitchTokenValidation, OAuthError> {
		let resp = self
			.http
			.get(self.url(VALIDATE_PATH)?)
			.header("Authorization", format!("OAuth {}", access_token.expose()))
			.send()
			.await?;

		let status = resp.status();
		let body = resp.text().await?;
		if !status.is_success() {
			return Err(OAuthError::Rejected {
				status: status.as_u16(),
				body,
			});
		}

		serde_json::from_str(&body).map_err(|e| OAuthError::InvalidResponse(format!("token validate: {e}")))
	}
}

#[cfg(test)]
mod tests {
	use wiremock::matchers::{body_string_contains, header, method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	use super::*;

	fn cfg(base_url: &str) -> OAuthConfig {
		let mut cfg = OAuthConfig::new("cid", SecretString::new("csecret"), "https://bridge.example.org/callback");
		cfg.base_url = base_url.to_string();
		cfg
	}

	#[test]
	fn authorize_url_carries_state_and_scopes() {
		let url = authorize_url(&cfg("https://id.twitch.tv"), "nonce-1").unwrap();
		assert_eq!(url.path(), "/oauth2/authorize");
		let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
		assert_eq!(pairs.get("state").map(String::as_str), Some("nonce-1"));
		assert_eq!(pairs.get("client_id").map(String::as_str), Some("cid"));
		assert_eq!(pairs.get("scope").map(String::as_str), Some("chat:read chat:edit"));
		assert_eq!(pairs.get("response_type").map(String::as_str), Some("code"));
	}

	#[tokio::test]
	async fn exchange_code_parses_token() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/oauth2/token"))
			.and(body_string_contains("code=abc"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"access_token": "tok",
				"refresh_token": "ref",
				"expires_in": 3600,
				"token_type": "bearer"
			})))
			.mount(&server)
			.await;

		let client = OAuthClient::new(cfg(&server.uri())).unwrap();
		let token = client.exchange_code("abc").await.unwrap();
		assert_eq!(token.access_token.expose(), "tok");
		assert_eq!(token.refresh_token.as_ref().map(|t| t.expose()), Some("ref"));
		assert_eq!(token.expires_in, Some(3600));
	}

	#[tokio::test]
	async fn exchange_code_surfaces_rejection() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/oauth2/token"))
			.respond_with(ResponseTemplate::new(400).set_body_string("{\"message\":\"Invalid authorization code\"}"))
			.mount(&server)
			.await;

		let client = OAuthClient::new(cfg(&server.uri())).unwrap();
		let err = client.exchange_code("bad").await.unwrap_err();
		assert!(matches!(err, OAuthError::Rejected { status: 400, .. }), "got {err:?}");
	}

	#[tokio::test]
	async fn validate_returns_login() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/oauth2/validate"))
			.and(header("Authorization", "OAuth tok"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"client_id": "cid",
				"login": "alice_tv",
				"user_id": "1234",
				"expires_in": 5000,
				"scopes": ["chat:read", "chat:edit"]
			})))
			.mount(&server)
			.await;

		let client = OAuthClient::new(cfg(&server.uri())).unwrap();
		let v = client.validate(&SecretString::new("tok")).await.unwrap();
		assert_eq!(v.login, "alice_tv");
		assert_eq!(v.scopes.len(), 2);
	}
}
