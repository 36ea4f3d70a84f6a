#![forbid(unsafe_code)]

mod bridge;
mod config;
mod server;
mod tls;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, bail};
use mxtwitch_platform::SecretString;
use mxtwitch_platform::matrix::{HomeserverClient, HomeserverConfig, MatrixApi, Registration};
use mxtwitch_platform::twitch::{IrcConnector, IrcConnectorConfig, OAuthClient, OAuthConfig};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::bridge::dispatcher::{Dispatcher, DispatcherConfig};
use crate::bridge::login::{LoginConfig, LoginFlow};
use crate::bridge::relay::{Relay, RelayConfig};
use crate::bridge::session::{SessionConfig, SessionManager};
use crate::bridge::store::{BridgeStore, SqlStore};
use crate::bridge::{BridgeContext, load_registry};
use crate::config::BridgeConfig;
use crate::server::appservice::{Appservice, AppserviceConfig, spawn_appservice_server};
use crate::server::callback::spawn_callback_server;
use crate::server::health::{HealthState, spawn_health_server};

/// Appservice events buffered between the HTTP listener and the dispatcher.
const EVENT_QUEUE_CAPACITY: usize = 1024;
const TXN_MEMORY: usize = 1024;

const USAGE: &str = "Usage: mxtwitch_bridge [--config PATH] [run | generate-registration [--url URL]]\n\
\n\
Commands:\n\
\trun                    Start the bridge (default)\n\
\tgenerate-registration  Write a new appservice registration file\n\
\n\
Options:\n\
\t--config   Config file (default: ~/.mxtwitch/config.toml)\n\
\t--url      URL the home server uses to reach the bridge\n\
\t           (generate-registration only; default: appservice.url or http://<appservice.bind>)\n\
\t--help     Show this help\n";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
	Run,
	GenerateRegistration { url: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliArgs {
	command: Command,
	config_path: Option<PathBuf>,
}

fn usage_and_exit() -> ! {
	eprintln!("{USAGE}");
	std::process::exit(2)
}

fn parse_args_from(args: impl IntoIterator<Item = String>) -> Result<CliArgs, String> {
	let mut command = None;
	let mut config_path = None;
	let mut url = None;

	let mut it = args.into_iter();
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--config" | "-c" => {
				let v = it.next().ok_or("--config needs a path")?;
				if v.trim().is_empty() {
					return Err("--config must be non-empty".to_string());
				}
				config_path = Some(PathBuf::from(v));
			}
			"--url" => {
				let v = it.next().ok_or("--url needs a value")?;
				if v.trim().is_empty() {
					return Err("--url must be non-empty".to_string());
				}
				url = Some(v);
			}
			"run" | "generate-registration" if command.is_none() => command = Some(arg.clone()),
			other => return Err(format!("Unknown argument: {other}")),
		}
	}

	let command = match command.as_deref() {
		Some("generate-registration") => Command::GenerateRegistration { url },
		_ if url.is_some() => return Err("--url only applies to generate-registration".to_string()),
		_ => Command::Run,
	};
	Ok(CliArgs { command, config_path })
}

fn parse_args() -> CliArgs {
	let args: Vec<String> = std::env::args().skip(1).collect();
	if args.iter().any(|a| a == "--help" || a == "-h") {
		usage_and_exit();
	}
	parse_args_from(args).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	})
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,mxtwitch_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("mxtwitch_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn parse_bind(what: &str, bind: &str) -> anyhow::Result<SocketAddr> {
	bind.parse::<SocketAddr>()
		.with_context(|| format!("invalid {what} {bind:?} (expected host:port)"))
}

/// Create the directory holding a file-backed SQLite database.
fn prepare_sqlite_dir(database_url: &str) -> anyhow::Result<()> {
	let Some(path) = database_url.strip_prefix("sqlite:") else {
		return Ok(());
	};
	let path = path.trim_start_matches("//");
	if path.is_empty() || path.starts_with(":memory:") {
		return Ok(());
	}
	let path = path.split('?').next().unwrap_or(path);
	if let Some(parent) = Path::new(path).parent()
		&& !parent.as_os_str().is_empty()
	{
		std::fs::create_dir_all(parent).with_context(|| format!("create database dir {}", parent.display()))?;
	}
	Ok(())
}

fn generate_registration(cfg: &BridgeConfig, url: Option<String>) -> anyhow::Result<PathBuf> {
	let path = cfg.registration_path()?;
	if path.exists() {
		bail!(
			"refusing to overwrite existing registration {}; delete it first to rotate tokens",
			path.display()
		);
	}

	let url = url.unwrap_or_else(|| cfg.appservice_url());
	let registration = Registration::generate(
		&cfg.appservice.id,
		&url,
		&cfg.appservice.sender_localpart,
		&cfg.appservice.puppet_prefix,
		cfg.server_name()?,
	);
	registration.save(&path)?;
	Ok(path)
}

async fn run(cfg: BridgeConfig) -> anyhow::Result<()> {
	cfg.validate_for_run()?;
	init_metrics(cfg.server.metrics_bind.as_deref());

	let server_name = cfg.server_name()?.to_string();
	let appservice_bind = parse_bind("appservice.bind", &cfg.appservice.bind)?;
	let public_bind = parse_bind("public.bind", &cfg.public.bind)?;

	let registration_path = cfg.registration_path()?;
	let registration = Registration::load(&registration_path)
		.context("load appservice registration (run generate-registration first)")?;
	info!(path = %registration_path.display(), id = %registration.id, "loaded appservice registration");

	let database_url = cfg.database_url()?;
	prepare_sqlite_dir(&database_url)?;
	let store: Arc<dyn BridgeStore> = Arc::new(SqlStore::connect(&database_url).await?);
	let registry = Arc::new(load_registry(store.as_ref(), &cfg.room_links()?, cfg.bot_user()?.as_ref()).await?);

	let (Some(homeserver_url), Some(client_id), Some(client_secret), Some(redirect_uri)) = (
		cfg.appservice.homeserver_url.clone(),
		cfg.twitch.client_id.clone(),
		cfg.twitch.client_secret.clone(),
		cfg.twitch.redirect_uri.clone(),
	) else {
		bail!("config validated without homeserver or twitch client settings");
	};

	let matrix: Arc<dyn MatrixApi> = Arc::new(
		HomeserverClient::new(HomeserverConfig {
			base_url: homeserver_url,
			as_token: SecretString::new(registration.as_token.clone()),
			bot: registry.bot().mxid.clone(),
		})
		.context("build home server client")?,
	);

	let mut oauth_cfg = OAuthConfig::new(client_id, client_secret, redirect_uri);
	if let Some(base_url) = cfg.twitch.oauth_base_url.clone() {
		oauth_cfg.base_url = base_url;
	}
	let oauth = Arc::new(OAuthClient::new(oauth_cfg.clone()).context("build twitch oauth client")?);

	let mut irc_cfg = IrcConnectorConfig::default();
	if let Some(ws_url) = cfg.twitch.chat_ws_url.clone() {
		irc_cfg.ws_url = ws_url;
	}
	let sessions = Arc::new(SessionManager::new(
		Arc::new(IrcConnector::new(irc_cfg)),
		SessionConfig {
			op_timeout: cfg.twitch.session_timeout,
		},
	));

	let login = Arc::new(LoginFlow::new(
		oauth,
		oauth_cfg,
		Arc::clone(&matrix),
		Arc::clone(&registry),
		Arc::clone(&store),
		Arc::clone(&sessions),
		LoginConfig {
			state_ttl: cfg.login.state_ttl,
			resend_cooldown: cfg.login.resend_cooldown,
		},
	));

	let ctx = BridgeContext {
		registry: Arc::clone(&registry),
		sessions: Arc::clone(&sessions),
		login: Arc::clone(&login),
		matrix: Arc::clone(&matrix),
		store,
	};

	let health_state = HealthState::new().with_bridge(Arc::clone(&registry), Arc::clone(&sessions));
	if let Some(bind) = cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => spawn_health_server(addr, health_state.clone()),
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
	let dispatcher = Arc::new(Dispatcher::new(ctx.clone(), DispatcherConfig::default()));
	let dispatcher_task = tokio::spawn(dispatcher.run(events_rx));

	let relay = Arc::new(Relay::new(
		ctx,
		RelayConfig::new(server_name.clone(), cfg.appservice.puppet_prefix.clone()),
	));
	let relay_tasks = Arc::clone(&relay).spawn();

	let appservice = Arc::new(Appservice::new(
		AppserviceConfig {
			hs_token: SecretString::new(registration.hs_token.clone()),
			server_name,
			puppet_prefix: cfg.appservice.puppet_prefix.clone(),
			txn_memory: TXN_MEMORY,
		},
		events_tx,
		matrix,
	));
	spawn_appservice_server(appservice_bind, appservice);

	let (Some(cert_path), Some(key_path)) = (cfg.public.tls_cert_path.as_deref(), cfg.public.tls_key_path.as_deref())
	else {
		bail!("config validated without tls cert/key");
	};
	info!(cert = %cert_path.display(), key = %key_path.display(), "loading TLS cert/key");
	let acceptor = crate::tls::load_tls_acceptor(cert_path, key_path)?;
	spawn_callback_server(public_bind, acceptor, login);

	health_state.mark_ready();
	info!(rooms = registry.counts().rooms, "bridge running");

	tokio::signal::ctrl_c().await.context("wait for shutdown signal")?;
	info!("shutting down");

	relay.stop();
	sessions.shutdown().await;
	for task in relay_tasks {
		task.abort();
	}
	dispatcher_task.abort();
	Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let args = parse_args();

	let config_path = match args.config_path {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let cfg = crate::config::load_bridge_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded bridge config (toml + env overrides)");

	match args.command {
		Command::GenerateRegistration { url } => {
			let path = generate_registration(&cfg, url)?;
			info!(path = %path.display(), "wrote appservice registration; add it to the home server config");
			Ok(())
		}
		Command::Run => run(cfg).await,
	}
}
