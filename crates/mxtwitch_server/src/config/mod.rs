#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow, bail};
use mxtwitch_domain::{MatrixRoomId, MatrixUserId, TwitchChannel};
use mxtwitch_platform::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

use crate::bridge::model::{BotUser, RoomLink};

/// `~/.mxtwitch`, where the config, registration and database live by default.
pub fn default_data_dir() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".mxtwitch"))
}

/// Default config path: `~/.mxtwitch/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	Ok(default_data_dir()?.join("config.toml"))
}

/// Load the bridge config from TOML and `MXTWITCH_*` env overrides.
pub fn load_bridge_config_from_path(path: &Path) -> anyhow::Result<BridgeConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = BridgeConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
	pub appservice: AppserviceSettings,
	pub twitch: TwitchSettings,
	pub public: PublicSettings,
	pub bot: BotSettings,
	pub rooms: Vec<RoomSettings>,
	pub persistence: PersistenceSettings,
	pub server: ServerSettings,
	pub login: LoginSettings,
}

/// Matrix side of the bridge.
#[derive(Debug, Clone)]
pub struct AppserviceSettings {
	/// Client-server API base URL of the home server.
	pub homeserver_url: Option<String>,
	/// Server name used in user ids (`example.org`).
	pub server_name: Option<String>,
	/// Listener for transactions pushed by the home server.
	pub bind: String,
	/// URL the home server uses to reach `bind`; written into the registration.
	pub url: Option<String>,
	pub registration_path: Option<PathBuf>,
	pub id: String,
	pub sender_localpart: String,
	pub puppet_prefix: String,
}

impl Default for AppserviceSettings {
	fn default() -> Self {
		Self {
			homeserver_url: None,
			server_name: None,
			bind: "127.0.0.1:29350".to_string(),
			url: None,
			registration_path: None,
			id: "twitch".to_string(),
			sender_localpart: "twitchbot".to_string(),
			puppet_prefix: "twitch_".to_string(),
		}
	}
}

#[derive(Debug, Clone)]
pub struct TwitchSettings {
	pub client_id: Option<String>,
	pub client_secret: Option<SecretString>,
	/// Must match the redirect URL registered with the Twitch application.
	pub redirect_uri: Option<String>,
	pub chat_ws_url: Option<String>,
	pub oauth_base_url: Option<String>,
	/// Upper bound for each connect, join and send.
	pub session_timeout: Duration,
}

impl Default for TwitchSettings {
	fn default() -> Self {
		Self {
			client_id: None,
			client_secret: None,
			redirect_uri: None,
			chat_ws_url: None,
			oauth_base_url: None,
			session_timeout: Duration::from_secs(10),
		}
	}
}

/// Public HTTPS listener for the OAuth redirect.
#[derive(Debug, Clone)]
pub struct PublicSettings {
	pub bind: String,
	pub tls_cert_path: Option<PathBuf>,
	pub tls_key_path: Option<PathBuf>,
}

impl Default for PublicSettings {
	fn default() -> Self {
		Self {
			bind: "0.0.0.0:8443".to_string(),
			tls_cert_path: None,
			tls_key_path: None,
		}
	}
}

/// Twitch account the bridge bot listens with.
#[derive(Debug, Clone, Default)]
pub struct BotSettings {
	pub twitch_name: Option<String>,
	pub twitch_token: Option<SecretString>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RoomSettings {
	pub room_id: String,
	pub channel: String,
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// `sqlite:` URL; defaults to `~/.mxtwitch/bridge.db`.
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoginSettings {
	pub state_ttl: Duration,
	pub resend_cooldown: Duration,
}

impl Default for LoginSettings {
	fn default() -> Self {
		Self {
			state_ttl: Duration::from_secs(600),
			resend_cooldown: Duration::from_secs(30),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	appservice: FileAppserviceSettings,

	#[serde(default)]
	twitch: FileTwitchSettings,

	#[serde(default)]
	public: FilePublicSettings,

	#[serde(default)]
	bot: FileBotSettings,

	#[serde(default)]
	rooms: Vec<RoomSettings>,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	login: FileLoginSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAppserviceSettings {
	homeserver_url: Option<String>,
	server_name: Option<String>,
	bind: Option<String>,
	url: Option<String>,
	registration_path: Option<String>,
	id: Option<String>,
	sender_localpart: Option<String>,
	puppet_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTwitchSettings {
	client_id: Option<String>,
	client_secret: Option<String>,
	redirect_uri: Option<String>,
	chat_ws_url: Option<String>,
	oauth_base_url: Option<String>,
	session_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePublicSettings {
	bind: Option<String>,
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBotSettings {
	twitch_name: Option<String>,
	twitch_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileLoginSettings {
	state_ttl_secs: Option<u64>,
	resend_cooldown_secs: Option<u64>,
}

fn non_blank(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl BridgeConfig {
	fn from_file(file: FileConfig) -> Self {
		let as_defaults = AppserviceSettings::default();
		let appservice = AppserviceSettings {
			homeserver_url: non_blank(file.appservice.homeserver_url),
			server_name: non_blank(file.appservice.server_name),
			bind: non_blank(file.appservice.bind).unwrap_or(as_defaults.bind),
			url: non_blank(file.appservice.url),
			registration_path: non_blank(file.appservice.registration_path).map(PathBuf::from),
			id: non_blank(file.appservice.id).unwrap_or(as_defaults.id),
			sender_localpart: non_blank(file.appservice.sender_localpart).unwrap_or(as_defaults.sender_localpart),
			puppet_prefix: non_blank(file.appservice.puppet_prefix).unwrap_or(as_defaults.puppet_prefix),
		};

		let twitch = TwitchSettings {
			client_id: non_blank(file.twitch.client_id),
			client_secret: non_blank(file.twitch.client_secret).map(SecretString::new),
			redirect_uri: non_blank(file.twitch.redirect_uri),
			chat_ws_url: non_blank(file.twitch.chat_ws_url),
			oauth_base_url: non_blank(file.twitch.oauth_base_url),
			session_timeout: file
				.twitch
				.session_timeout_ms
				.filter(|v| *v > 0)
				.map(Duration::from_millis)
				.unwrap_or(TwitchSettings::default().session_timeout),
		};

		let login_defaults = LoginSettings::default();

		Self {
			appservice,
			twitch,
			public: PublicSettings {
				bind: non_blank(file.public.bind).unwrap_or(PublicSettings::default().bind),
				tls_cert_path: non_blank(file.public.tls_cert_path).map(PathBuf::from),
				tls_key_path: non_blank(file.public.tls_key_path).map(PathBuf::from),
			},
			bot: BotSettings {
				twitch_name: non_blank(file.bot.twitch_name),
				twitch_token: non_blank(file.bot.twitch_token).map(SecretString::new),
			},
			rooms: file.rooms,
			persistence: PersistenceSettings {
				database_url: non_blank(file.persistence.database_url),
			},
			server: ServerSettings {
				metrics_bind: non_blank(file.server.metrics_bind),
				health_bind: non_blank(file.server.health_bind),
			},
			login: LoginSettings {
				state_ttl: file
					.login
					.state_ttl_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(login_defaults.state_ttl),
				resend_cooldown: file
					.login
					.resend_cooldown_secs
					.map(Duration::from_secs)
					.unwrap_or(login_defaults.resend_cooldown),
			},
		}
	}

	/// Fail fast on settings `run` cannot start without.
	pub fn validate_for_run(&self) -> anyhow::Result<()> {
		let mut missing = Vec::new();
		if self.appservice.homeserver_url.is_none() {
			missing.push("appservice.homeserver_url");
		}
		if self.appservice.server_name.is_none() {
			missing.push("appservice.server_name");
		}
		if self.twitch.client_id.is_none() {
			missing.push("twitch.client_id");
		}
		if self.twitch.client_secret.is_none() {
			missing.push("twitch.client_secret");
		}
		if self.twitch.redirect_uri.is_none() {
			missing.push("twitch.redirect_uri");
		}
		if self.public.tls_cert_path.is_none() {
			missing.push("public.tls_cert_path");
		}
		if self.public.tls_key_path.is_none() {
			missing.push("public.tls_key_path");
		}
		if !missing.is_empty() {
			bail!("missing required config: {}", missing.join(", "));
		}

		if self.login.resend_cooldown >= self.login.state_ttl {
			warn!("login config: resend_cooldown >= state_ttl; expired links cannot be replaced until the cooldown ends");
		}
		Ok(())
	}

	pub fn server_name(&self) -> anyhow::Result<&str> {
		self.appservice
			.server_name
			.as_deref()
			.ok_or_else(|| anyhow!("appservice.server_name is not set"))
	}

	/// The bridge bot's Matrix id, `@{sender_localpart}:{server_name}`.
	pub fn bot_mxid(&self) -> anyhow::Result<MatrixUserId> {
		MatrixUserId::from_parts(&self.appservice.sender_localpart, self.server_name()?).context("build bot user id")
	}

	pub fn registration_path(&self) -> anyhow::Result<PathBuf> {
		match &self.appservice.registration_path {
			Some(path) => Ok(path.clone()),
			None => Ok(default_data_dir()?.join("registration.yaml")),
		}
	}

	/// URL written into the registration for the home server to push to.
	pub fn appservice_url(&self) -> String {
		self.appservice
			.url
			.clone()
			.unwrap_or_else(|| format!("http://{}", self.appservice.bind))
	}

	pub fn database_url(&self) -> anyhow::Result<String> {
		match &self.persistence.database_url {
			Some(url) => Ok(url.clone()),
			None => Ok(format!("sqlite:{}", default_data_dir()?.join("bridge.db").display())),
		}
	}

	/// Room bindings declared in the config.
	pub fn room_links(&self) -> anyhow::Result<Vec<RoomLink>> {
		self.rooms
			.iter()
			.map(|r| {
				Ok(RoomLink {
					room_id: MatrixRoomId::new(r.room_id.trim()).with_context(|| format!("rooms: room_id {:?}", r.room_id))?,
					channel: TwitchChannel::new(&r.channel).with_context(|| format!("rooms: channel {:?}", r.channel))?,
				})
			})
			.collect()
	}

	/// Bot record declared in the config, if any.
	pub fn bot_user(&self) -> anyhow::Result<Option<BotUser>> {
		match (&self.bot.twitch_name, &self.bot.twitch_token) {
			(None, None) => Ok(None),
			(Some(name), Some(token)) => Ok(Some(BotUser {
				mxid: self.bot_mxid()?,
				twitch_name: name.to_ascii_lowercase(),
				access_token: token.clone(),
			})),
			_ => bail!("bot.twitch_name and bot.twitch_token must be set together"),
		}
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut BridgeConfig, lookup: impl Fn(&str) -> Option<String>) {
	let var = |key: &str| non_blank(lookup(key));

	if let Some(v) = var("MXTWITCH_HOMESERVER_URL") {
		cfg.appservice.homeserver_url = Some(v);
		info!("appservice config: homeserver_url overridden by env");
	}

	if let Some(v) = var("MXTWITCH_SERVER_NAME") {
		cfg.appservice.server_name = Some(v);
		info!("appservice config: server_name overridden by env");
	}

	if let Some(v) = var("MXTWITCH_APPSERVICE_BIND") {
		cfg.appservice.bind = v;
		info!("appservice config: bind overridden by env");
	}

	if let Some(v) = var("MXTWITCH_APPSERVICE_URL") {
		cfg.appservice.url = Some(v);
		info!("appservice config: url overridden by env");
	}

	if let Some(v) = var("MXTWITCH_REGISTRATION_PATH") {
		cfg.appservice.registration_path = Some(PathBuf::from(v));
		info!("appservice config: registration_path overridden by env");
	}

	if let Some(v) = var("MXTWITCH_TWITCH_CLIENT_ID") {
		cfg.twitch.client_id = Some(v);
		info!("twitch config: client_id overridden by env");
	}

	if let Some(v) = var("MXTWITCH_TWITCH_CLIENT_SECRET") {
		cfg.twitch.client_secret = Some(SecretString::new(v));
		info!("twitch config: client_secret overridden by env");
	}

	if let Some(v) = var("MXTWITCH_TWITCH_REDIRECT_URI") {
		cfg.twitch.redirect_uri = Some(v);
		info!("twitch config: redirect_uri overridden by env");
	}

	if let Some(v) = var("MXTWITCH_TWITCH_SESSION_TIMEOUT_MS")
		&& let Ok(ms) = v.parse::<u64>()
		&& ms > 0
	{
		cfg.twitch.session_timeout = Duration::from_millis(ms);
		info!(ms, "twitch config: session_timeout overridden by env");
	}

	if let Some(v) = var("MXTWITCH_PUBLIC_BIND") {
		cfg.public.bind = v;
		info!("public config: bind overridden by env");
	}

	if let Some(v) = var("MXTWITCH_TLS_CERT") {
		cfg.public.tls_cert_path = Some(PathBuf::from(v));
		info!("public config: tls_cert_path overridden by env");
	}

	if let Some(v) = var("MXTWITCH_TLS_KEY") {
		cfg.public.tls_key_path = Some(PathBuf::from(v));
		info!("public config: tls_key_path overridden by env");
	}

	if let Some(v) = var("MXTWITCH_BOT_TWITCH_NAME") {
		cfg.bot.twitch_name = Some(v);
		info!("bot config: twitch_name overridden by env");
	}

	if let Some(v) = var("MXTWITCH_BOT_TWITCH_TOKEN") {
		cfg.bot.twitch_token = Some(SecretString::new(v));
		info!("bot config: twitch_token overridden by env");
	}

	if let Some(v) = var("MXTWITCH_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Some(v) = var("MXTWITCH_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = var("MXTWITCH_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = var("MXTWITCH_LOGIN_STATE_TTL_SECS")
		&& let Ok(secs) = v.parse::<u64>()
		&& secs > 0
	{
		cfg.login.state_ttl = Duration::from_secs(secs);
		info!(secs, "login config: state_ttl overridden by env");
	}

	if let Some(v) = var("MXTWITCH_LOGIN_RESEND_COOLDOWN_SECS")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.login.resend_cooldown = Duration::from_secs(secs);
		info!(secs, "login config: resend_cooldown overridden by env");
	}

	if cfg.twitch.client_id.is_none() {
		warn!("twitch config: no client_id configured; login links cannot be issued");
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;
	use std::io::Write as _;

	use super::*;

	fn parse(toml_src: &str) -> BridgeConfig {
		BridgeConfig::from_file(toml::from_str(toml_src).unwrap())
	}

	fn complete() -> BridgeConfig {
		parse(
			r##"
			[appservice]
			homeserver_url = "https://matrix.example.org"
			server_name = "example.org"

			[twitch]
			client_id = "cid"
			client_secret = "secret"
			redirect_uri = "https://bridge.example.org:8443/callback"

			[public]
			tls_cert_path = "/etc/bridge/cert.pem"
			tls_key_path = "/etc/bridge/key.pem"

			[bot]
			twitch_name = "BridgeBot"
			twitch_token = "bot-token"

			[[rooms]]
			room_id = "!r1:example.org"
			channel = "#Chan1"
			"##,
		)
	}

	#[test]
	fn defaults_apply_to_an_empty_file() {
		let cfg = parse("");
		assert_eq!(cfg.appservice.bind, "127.0.0.1:29350");
		assert_eq!(cfg.appservice.sender_localpart, "twitchbot");
		assert_eq!(cfg.appservice.puppet_prefix, "twitch_");
		assert_eq!(cfg.public.bind, "0.0.0.0:8443");
		assert_eq!(cfg.twitch.session_timeout, Duration::from_secs(10));
		assert_eq!(cfg.login.state_ttl, Duration::from_secs(600));
		assert_eq!(cfg.login.resend_cooldown, Duration::from_secs(30));
		assert!(cfg.rooms.is_empty());
		assert_eq!(cfg.appservice_url(), "http://127.0.0.1:29350");
	}

	#[test]
	fn blank_strings_are_unset() {
		let cfg = parse(
			r#"
			[twitch]
			client_id = "   "
			client_secret = ""
			[appservice]
			bind = " "
			"#,
		);
		assert!(cfg.twitch.client_id.is_none());
		assert!(cfg.twitch.client_secret.is_none());
		assert_eq!(cfg.appservice.bind, "127.0.0.1:29350");
	}

	#[test]
	fn complete_config_validates() {
		let cfg = complete();
		cfg.validate_for_run().unwrap();
		assert_eq!(cfg.bot_mxid().unwrap().as_str(), "@twitchbot:example.org");

		let links = cfg.room_links().unwrap();
		assert_eq!(links.len(), 1);
		assert_eq!(links[0].channel.as_str(), "chan1");

		let bot = cfg.bot_user().unwrap().unwrap();
		assert_eq!(bot.twitch_name, "bridgebot");
		assert_eq!(bot.access_token.expose(), "bot-token");
	}

	#[test]
	fn missing_settings_are_listed() {
		let err = parse("").validate_for_run().unwrap_err().to_string();
		for key in [
			"appservice.homeserver_url",
			"twitch.client_id",
			"twitch.redirect_uri",
			"public.tls_cert_path",
			"public.tls_key_path",
		] {
			assert!(err.contains(key), "{key} missing from: {err}");
		}
	}

	#[test]
	fn bad_room_binding_is_an_error() {
		let cfg = parse(
			r#"
			[[rooms]]
			room_id = "not-a-room"
			channel = "chan1"
			"#,
		);
		let err = cfg.room_links().unwrap_err();
		assert!(format!("{err:#}").contains("not-a-room"), "{err:#}");
	}

	#[test]
	fn half_configured_bot_is_an_error() {
		let mut cfg = complete();
		cfg.bot.twitch_token = None;
		assert!(cfg.bot_user().is_err());

		cfg.bot.twitch_name = None;
		assert!(cfg.bot_user().unwrap().is_none());
	}

	#[test]
	fn env_overrides_win_and_ignore_blanks() {
		let mut cfg = complete();
		let env: HashMap<&str, &str> = HashMap::from([
			("MXTWITCH_TWITCH_CLIENT_ID", "env-cid"),
			("MXTWITCH_SERVER_NAME", " "),
			("MXTWITCH_TLS_CERT", "/run/cert.pem"),
			("MXTWITCH_TWITCH_SESSION_TIMEOUT_MS", "2500"),
			("MXTWITCH_LOGIN_STATE_TTL_SECS", "not-a-number"),
			("MXTWITCH_DATABASE_URL", "sqlite::memory:"),
		]);
		apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

		assert_eq!(cfg.twitch.client_id.as_deref(), Some("env-cid"));
		assert_eq!(cfg.appservice.server_name.as_deref(), Some("example.org"));
		assert_eq!(cfg.public.tls_cert_path, Some(PathBuf::from("/run/cert.pem")));
		assert_eq!(cfg.twitch.session_timeout, Duration::from_millis(2500));
		assert_eq!(cfg.login.state_ttl, Duration::from_secs(600));
		assert_eq!(cfg.database_url().unwrap(), "sqlite::memory:");
	}

	#[test]
	fn missing_file_yields_defaults() {
		let dir = tempfile::tempdir().unwrap();
		let cfg = read_toml_if_exists(&dir.path().join("absent.toml")).unwrap();
		assert!(cfg.is_none());
	}

	#[test]
	fn invalid_toml_is_reported() {
		let mut f = tempfile::NamedTempFile::new().unwrap();
		f.write_all(b"[appservice\nbind = 1").unwrap();
		let err = read_toml_if_exists(f.path()).unwrap_err();
		assert!(format!("{err:#}").contains("parse TOML"), "{err:#}");
	}
}
