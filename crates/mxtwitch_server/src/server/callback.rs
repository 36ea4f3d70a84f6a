#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use super::{HttpResponse, empty, respond_with};
use crate::bridge::login::{CallbackParams, LoginError, LoginFlow};

pub const CALLBACK_PATH: &str = "/callback";

fn page(status: StatusCode, title: &str, message: &str) -> HttpResponse {
	let body = format!(
		"<!doctype html>\n<html><head><meta charset=\"utf-8\"><title>{title}</title></head>\
		 <body><h1>{title}</h1><p>{message}</p></body></html>\n",
		title = escape_html(title),
		message = escape_html(message),
	);
	respond_with(status, "text/html; charset=utf-8", body)
}

fn escape_html(s: &str) -> String {
	let mut out = String::with_capacity(s.len());
	for c in s.chars() {
		match c {
			'&' => out.push_str("&amp;"),
			'<' => out.push_str("&lt;"),
			'>' => out.push_str("&gt;"),
			'"' => out.push_str("&quot;"),
			'\'' => out.push_str("&#39;"),
			c => out.push(c),
		}
	}
	out
}

/// Serve one request on the public listener.
pub async fn respond(login: &LoginFlow, method: &Method, uri: &Uri) -> HttpResponse {
	if uri.path() != CALLBACK_PATH {
		return empty(StatusCode::NOT_FOUND);
	}
	if method != Method::GET {
		return empty(StatusCode::METHOD_NOT_ALLOWED);
	}

	let params = CallbackParams::from_query(uri.query().unwrap_or_default());
	match login.handle_callback(params).await {
		Ok(linked) => page(
			StatusCode::OK,
			"Twitch account linked",
			&format!(
				"Your Twitch account {} is now linked to {}. You can close this page.",
				linked.twitch_login, linked.user
			),
		),
		Err(e) => {
			metrics::counter!("mxtwitch_login_callback_failures_total").increment(1);
			let (status, message) = match &e {
				LoginError::Denied(_) => (StatusCode::BAD_REQUEST, "Authorization was denied on Twitch."),
				LoginError::InvalidState => (
					StatusCode::BAD_REQUEST,
					"This login link is no longer valid. Rejoin the room to get a new one.",
				),
				LoginError::MissingCode => (StatusCode::BAD_REQUEST, "The request is missing an authorization code."),
				LoginError::Exchange(_) => (StatusCode::BAD_GATEWAY, "Twitch did not accept the authorization code."),
				LoginError::Url(_) | LoginError::Delivery(_) => {
					(StatusCode::INTERNAL_SERVER_ERROR, "The bridge could not complete the login.")
				}
			};
			if status.is_server_error() {
				warn!(error = %e, "oauth callback failed");
			} else {
				debug!(error = %e, "oauth callback rejected");
			}
			page(status, "Login failed", message)
		}
	}
}

pub fn spawn_callback_server(bind: SocketAddr, acceptor: TlsAcceptor, login: Arc<LoginFlow>) {
	tokio::spawn(async move {
		if let Err(err) = run_callback_server(bind, acceptor, login).await {
			warn!(error = %err, "oauth callback listener stopped");
		}
	});
}

async fn run_callback_server(bind: SocketAddr, acceptor: TlsAcceptor, login: Arc<LoginFlow>) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	info!(%bind, "oauth callback listener started");
	loop {
		let (stream, addr) = listener.accept().await?;
		let acceptor = acceptor.clone();
		let login = Arc::clone(&login);
		tokio::spawn(async move {
			let tls = match acceptor.accept(stream).await {
				Ok(tls) => tls,
				Err(err) => {
					debug!(%addr, error = %err, "tls handshake failed");
					return;
				}
			};
			let io = TokioIo::new(tls);
			let service = service_fn(move |req| handle_request(req, Arc::clone(&login)));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "oauth callback connection error");
			}
		});
	}
}

async fn handle_request(req: Request<Incoming>, login: Arc<LoginFlow>) -> Result<HttpResponse, hyper::Error> {
	Ok(respond(&login, req.method(), req.uri()).await)
}
