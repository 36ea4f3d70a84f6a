#![forbid(unsafe_code)]

pub mod appservice;
pub mod callback;
pub mod health;

#[cfg(test)]
mod appservice_tests;


use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::{Response, StatusCode};

pub type HttpResponse = Response<Full<Bytes>>;

pub(crate) fn respond_with(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> HttpResponse {
	let mut resp = Response::new(Full::new(body.into()));
	*resp.status_mut() = status;
	resp.headers_mut()
		.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
	resp
}

pub(crate) fn empty(status: StatusCode) -> HttpResponse {
	let mut resp = Response::new(Full::new(Bytes::new()));
	*resp.status_mut() = status;
	resp
}

pub(crate) fn text(status: StatusCode, body: &'static str) -> HttpResponse {
	respond_with(status, "text/plain; charset=utf-8", Bytes::from_static(body.as_bytes()))
}

pub(crate) fn json(status: StatusCode, value: &serde_json::Value) -> HttpResponse {
	respond_with(status, "application/json", value.to_string())
}

/// Matrix-style error body.
pub(crate) fn matrix_error(status: StatusCode, errcode: &str, error: &str) -> HttpResponse {
	json(status, &serde_json::json!({ "errcode": errcode, "error": error }))
}
