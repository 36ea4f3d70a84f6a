#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt as _, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::header::AUTHORIZATION;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use mxtwitch_domain::MatrixUserId;
use mxtwitch_platform::SecretString;
use mxtwitch_platform::matrix::{BridgeEvent, MatrixApi, decode_transaction};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{HttpResponse, json, matrix_error};

const APP_PREFIX: &str = "/_matrix/app/v1";
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct AppserviceConfig {
	pub hs_token: SecretString,
	pub server_name: String,
	pub puppet_prefix: String,
	/// Transaction ids remembered for deduplication.
	pub txn_memory: usize,
}

/// Remembers the most recent transaction ids and those still being queued.
#[derive(Debug, Default)]
struct TxnLog {
	seen: HashSet<String>,
	order: VecDeque<String>,
	in_flight: HashMap<String, watch::Receiver<bool>>,
}

enum Admission {
	Seen,
	/// Another request is queuing the same transaction.
	Pending(watch::Receiver<bool>),
	Reserved(watch::Sender<bool>),
}

impl TxnLog {
	fn admit(&mut self, txn: &str) -> Admission {
		if self.seen.contains(txn) {
			return Admission::Seen;
		}
		if let Some(rx) = self.in_flight.get(txn) {
			return Admission::Pending(rx.clone());
		}
		let (tx, rx) = watch::channel(false);
		self.in_flight.insert(txn.to_string(), rx);
		Admission::Reserved(tx)
	}

	fn insert(&mut self, txn: String, cap: usize) {
		self.in_flight.remove(&txn);
		if !self.seen.insert(txn.clone()) {
			return;
		}
		self.order.push_back(txn);
		while self.order.len() > cap.max(1) {
			if let Some(old) = self.order.pop_front() {
				self.seen.remove(&old);
			}
		}
	}
}

/// Holds a transaction id while its events are queued. Dropping it without
/// `commit` releases the id so the home server may retry.
struct TxnReservation<'a> {
	log: &'a Mutex<TxnLog>,
	txn: String,
	cap: usize,
	done: Option<watch::Sender<bool>>,
}

impl TxnReservation<'_> {
	fn commit(mut self) {
		self.log.lock().insert(self.txn.clone(), self.cap);
		if let Some(done) = self.done.take() {
			let _ = done.send(true);
		}
	}
}

impl Drop for TxnReservation<'_> {
	fn drop(&mut self) {
		if self.done.is_some() {
			self.log.lock().in_flight.remove(&self.txn);
		}
	}
}

/// Receives transactions pushed by the home server.
pub struct Appservice {
	cfg: AppserviceConfig,
	events: mpsc::Sender<BridgeEvent>,
	matrix: Arc<dyn MatrixApi>,
	txns: Mutex<TxnLog>,
}

impl Appservice {
	pub fn new(cfg: AppserviceConfig, events: mpsc::Sender<BridgeEvent>, matrix: Arc<dyn MatrixApi>) -> Self {
		Self {
			cfg,
			events,
			matrix,
			txns: Mutex::new(TxnLog::default()),
		}
	}

	fn authorized(&self, uri: &Uri, authorization: Option<&str>) -> bool {
		let expected = self.cfg.hs_token.expose();
		if expected.is_empty() {
			return false;
		}
		if let Some(token) = authorization.and_then(|h| h.strip_prefix("Bearer ")) {
			return token.trim() == expected;
		}
		uri.query()
			.into_iter()
			.flat_map(|q| url::form_urlencoded::parse(q.as_bytes()))
			.any(|(k, v)| k == "access_token" && v == expected)
	}

	fn is_puppet(&self, user: &MatrixUserId) -> bool {
		let Some((local, server)) = user.as_str()[1..].split_once(':') else {
			return false;
		};
		server == self.cfg.server_name
			&& local
				.strip_prefix(self.cfg.puppet_prefix.as_str())
				.is_some_and(|rest| !rest.is_empty())
	}

	/// Handle one request from the home server.
	pub async fn respond(&self, method: &Method, uri: &Uri, authorization: Option<&str>, body: Bytes) -> HttpResponse {
		if !self.authorized(uri, authorization) {
			metrics::counter!("mxtwitch_appservice_rejected_total").increment(1);
			return matrix_error(StatusCode::FORBIDDEN, "M_FORBIDDEN", "bad hs_token");
		}

		let path = uri.path();
		let route = path.strip_prefix(APP_PREFIX).unwrap_or(path);

		if let Some(txn) = route.strip_prefix("/transactions/") {
			if method != Method::PUT {
				return matrix_error(StatusCode::METHOD_NOT_ALLOWED, "M_UNRECOGNIZED", "use PUT");
			}
			return self.transaction(txn, &body).await;
		}
		if let Some(user) = route.strip_prefix("/users/") {
			if method != Method::GET {
				return matrix_error(StatusCode::METHOD_NOT_ALLOWED, "M_UNRECOGNIZED", "use GET");
			}
			return self.user_query(user).await;
		}
		if route.starts_with("/rooms/") {
			return matrix_error(StatusCode::NOT_FOUND, "M_NOT_FOUND", "no such room alias");
		}

		matrix_error(StatusCode::NOT_FOUND, "M_UNRECOGNIZED", "unrecognized request")
	}

	async fn transaction(&self, txn: &str, body: &[u8]) -> HttpResponse {
		let txn = percent_decode(txn);
		if txn.is_empty() || txn.contains('/') {
			return matrix_error(StatusCode::NOT_FOUND, "M_UNRECOGNIZED", "unrecognized request");
		}
		let admission = self.txns.lock().admit(&txn);
		let done = match admission {
			Admission::Seen => {
				debug!(%txn, "duplicate transaction acknowledged");
				return json(StatusCode::OK, &serde_json::json!({}));
			}
			Admission::Pending(mut rx) => {
				debug!(%txn, "waiting on concurrent delivery of transaction");
				return match rx.wait_for(|done| *done).await {
					Ok(_) => json(StatusCode::OK, &serde_json::json!({})),
					Err(_) => matrix_error(StatusCode::SERVICE_UNAVAILABLE, "M_UNKNOWN", "transaction not accepted, retry"),
				};
			}
			Admission::Reserved(done) => done,
		};
		let reservation = TxnReservation {
			log: &self.txns,
			txn: txn.clone(),
			cap: self.cfg.txn_memory,
			done: Some(done),
		};

		let events = match decode_transaction(body) {
			Ok(events) => events,
			Err(e) => {
				warn!(%txn, error = %e, "rejecting malformed transaction");
				return matrix_error(StatusCode::BAD_REQUEST, "M_NOT_JSON", "malformed transaction body");
			}
		};

		let count = events.len();
		for event in events {
			if self.events.send(event).await.is_err() {
				warn!(%txn, "event queue closed; transaction not accepted");
				return matrix_error(StatusCode::SERVICE_UNAVAILABLE, "M_UNKNOWN", "bridge is shutting down");
			}
		}

		reservation.commit();
		metrics::counter!("mxtwitch_transactions_total").increment(1);
		debug!(%txn, events = count, "transaction accepted");
		json(StatusCode::OK, &serde_json::json!({}))
	}

	async fn user_query(&self, raw: &str) -> HttpResponse {
		let Ok(user) = MatrixUserId::new(percent_decode(raw)) else {
			return matrix_error(StatusCode::NOT_FOUND, "M_NOT_FOUND", "not a bridge user");
		};
		if !self.is_puppet(&user) {
			return matrix_error(StatusCode::NOT_FOUND, "M_NOT_FOUND", "not a bridge user");
		}

		match self.matrix.ensure_puppet(user.localpart()).await {
			Ok(()) => json(StatusCode::OK, &serde_json::json!({})),
			Err(e) => {
				warn!(%user, error = %e, "failed to provision queried puppet");
				matrix_error(StatusCode::INTERNAL_SERVER_ERROR, "M_UNKNOWN", "could not provision user")
			}
		}
	}
}

fn percent_decode(s: &str) -> String {
	urlencoding::decode(s).map(|c| c.into_owned()).unwrap_or_else(|_| s.to_string())
}

pub fn spawn_appservice_server(bind: SocketAddr, appservice: Arc<Appservice>) {
	tokio::spawn(async move {
		if let Err(err) = run_appservice_server(bind, appservice).await {
			warn!(error = %err, "appservice listener stopped");
		}
	});
}

async fn run_appservice_server(bind: SocketAddr, appservice: Arc<Appservice>) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	info!(%bind, "appservice listener started");
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let appservice = Arc::clone(&appservice);
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_request(req, Arc::clone(&appservice)));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "appservice connection error");
			}
		});
	}
}

async fn handle_request(req: Request<Incoming>, appservice: Arc<Appservice>) -> Result<HttpResponse, hyper::Error> {
	let (parts, body) = req.into_parts();
	let body = match Limited::new(body, MAX_BODY_BYTES).collect().await {
		Ok(collected) => collected.to_bytes(),
		Err(e) if e.is::<LengthLimitError>() => {
			return Ok(matrix_error(StatusCode::PAYLOAD_TOO_LARGE, "M_TOO_LARGE", "request body too large"));
		}
		Err(e) => {
			debug!(error = %e, "failed to read appservice request body");
			return Ok(matrix_error(StatusCode::BAD_REQUEST, "M_BAD_JSON", "unreadable request body"));
		}
	};
	let authorization = parts.headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
	Ok(appservice.respond(&parts.method, &parts.uri, authorization, body).await)
}
