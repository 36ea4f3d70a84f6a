#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::{HttpResponse, empty, json, text};
use crate::bridge::registry::{RegistryCounts, SessionRegistry};
use crate::bridge::session::SessionManager;

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	bridge: Option<(Arc<SessionRegistry>, Arc<SessionManager>)>,
}

#[derive(Debug, Serialize)]
struct StatusBody {
	ready: bool,
	#[serde(flatten)]
	counts: RegistryCounts,
	live_sessions: usize,
}

impl HealthState {
	pub fn new() -> Self {
		Self::default()
	}

	/// Report bridge counts on `/status`.
	pub fn with_bridge(mut self, registry: Arc<SessionRegistry>, sessions: Arc<SessionManager>) -> Self {
		self.bridge = Some((registry, sessions));
		self
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	info!(%bind, "health listener started");
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<HttpResponse, hyper::Error> {
	Ok(respond(&state, req.method(), req.uri().path()))
}

pub(crate) fn respond(state: &HealthState, method: &Method, path: &str) -> HttpResponse {
	if method != Method::GET {
		return empty(StatusCode::METHOD_NOT_ALLOWED);
	}

	match path {
		"/healthz" => text(StatusCode::OK, "ok"),
		"/readyz" => {
			if state.is_ready() {
				text(StatusCode::OK, "ready")
			} else {
				text(StatusCode::SERVICE_UNAVAILABLE, "not-ready")
			}
		}
		"/status" => {
			let (counts, live_sessions) = match &state.bridge {
				Some((registry, sessions)) => (registry.counts(), sessions.live_count()),
				None => (RegistryCounts::default(), 0),
			};
			let body = StatusBody {
				ready: state.is_ready(),
				counts,
				live_sessions,
			};
			match serde_json::to_value(&body) {
				Ok(value) => json(StatusCode::OK, &value),
				Err(_) => empty(StatusCode::INTERNAL_SERVER_ERROR),
			}
		}
		_ => empty(StatusCode::NOT_FOUND),
	}
}

#[cfg(test)]
mod tests {
	use http_body_util::BodyExt as _;

	use super::*;
	use crate::bridge::testing::Harness;

	async fn body_of(resp: HttpResponse) -> String {
		let bytes = resp.into_body().collect().await.unwrap().to_bytes();
		String::from_utf8(bytes.to_vec()).unwrap()
	}

	#[tokio::test]
	async fn readiness_follows_mark_ready() {
		let state = HealthState::new();
		assert_eq!(respond(&state, &Method::GET, "/healthz").status(), StatusCode::OK);
		assert_eq!(
			respond(&state, &Method::GET, "/readyz").status(),
			StatusCode::SERVICE_UNAVAILABLE
		);

		state.mark_ready();
		let resp = respond(&state, &Method::GET, "/readyz");
		assert_eq!(resp.status(), StatusCode::OK);
		assert_eq!(body_of(resp).await, "ready");
	}

	#[tokio::test]
	async fn status_reports_bridge_counts() {
		let h = Harness::new();
		h.authenticate("@alice:example.org", "alice_tv");
		let state = HealthState::new().with_bridge(h.ctx.registry.clone(), h.ctx.sessions.clone());
		state.mark_ready();

		let resp = respond(&state, &Method::GET, "/status");
		assert_eq!(resp.status(), StatusCode::OK);
		let body: serde_json::Value = serde_json::from_str(&body_of(resp).await).unwrap();
		assert_eq!(body["ready"], true);
		assert_eq!(body["rooms"], 1);
		assert_eq!(body["users"], 1);
		assert_eq!(body["authenticated_users"], 1);
		assert_eq!(body["puppets"], 0);
		assert_eq!(body["live_sessions"], 0);
	}

	#[test]
	fn other_paths_and_methods() {
		let state = HealthState::new();
		assert_eq!(respond(&state, &Method::GET, "/nope").status(), StatusCode::NOT_FOUND);
		assert_eq!(
			respond(&state, &Method::POST, "/healthz").status(),
			StatusCode::METHOD_NOT_ALLOWED
		);
	}
}
