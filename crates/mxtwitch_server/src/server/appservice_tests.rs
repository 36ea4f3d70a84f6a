#![forbid(unsafe_code)]

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::BodyExt as _;
use hyper::{Method, StatusCode, Uri};
use mxtwitch_platform::SecretString;
use mxtwitch_platform::matrix::{BridgeEvent, EventKind, Membership, MessageContent};
use tokio::sync::mpsc;

use crate::bridge::testing::FakeMatrix;
use crate::server::HttpResponse;
use crate::server::appservice::{Appservice, AppserviceConfig};

const HS_TOKEN: &str = "hs-secret";
const BEARER: Option<&str> = Some("Bearer hs-secret");

struct Fixture {
	appservice: Appservice,
	events: mpsc::Receiver<BridgeEvent>,
	matrix: Arc<FakeMatrix>,
}

fn config() -> AppserviceConfig {
	AppserviceConfig {
		hs_token: SecretString::new(HS_TOKEN),
		server_name: "example.org".to_string(),
		puppet_prefix: "twitch_".to_string(),
		txn_memory: 2,
	}
}

fn fixture() -> Fixture {
	let (tx, rx) = mpsc::channel(64);
	let matrix = Arc::new(FakeMatrix::default());
	Fixture {
		appservice: Appservice::new(config(), tx, matrix.clone()),
		events: rx,
		matrix,
	}
}

fn uri(s: &str) -> Uri {
	s.parse().unwrap()
}

fn transaction_body() -> Bytes {
	Bytes::from(
		serde_json::json!({
			"events": [
				{
					"type": "m.room.member",
					"event_id": "$join",
					"sender": "@alice:example.org",
					"room_id": "!r1:example.org",
					"state_key": "@alice:example.org",
					"content": { "membership": "join" }
				},
				{
					"type": "m.room.message",
					"event_id": "$msg",
					"sender": "@alice:example.org",
					"room_id": "!r1:example.org",
					"content": { "msgtype": "m.text", "body": "hello" }
				}
			]
		})
		.to_string(),
	)
}

async fn errcode(resp: HttpResponse) -> String {
	let bytes = resp.into_body().collect().await.unwrap().to_bytes();
	let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
	value["errcode"].as_str().unwrap_or_default().to_string()
}

fn drain(rx: &mut mpsc::Receiver<BridgeEvent>) -> Vec<BridgeEvent> {
	let mut out = Vec::new();
	while let Ok(ev) = rx.try_recv() {
		out.push(ev);
	}
	out
}

#[tokio::test]
async fn transaction_events_reach_the_queue_in_order() {
	let mut f = fixture();
	let resp = f
		.appservice
		.respond(&Method::PUT, &uri("/_matrix/app/v1/transactions/1"), BEARER, transaction_body())
		.await;
	assert_eq!(resp.status(), StatusCode::OK);

	let events = drain(&mut f.events);
	assert_eq!(events.len(), 2);
	assert!(matches!(
		events[0].kind,
		EventKind::Membership {
			membership: Membership::Join,
			..
		}
	));
	assert_eq!(
		events[1].kind,
		EventKind::Message(MessageContent::Text {
			body: "hello".to_string()
		})
	);
}

#[tokio::test]
async fn missing_or_wrong_token_is_forbidden() {
	let mut f = fixture();
	let path = uri("/_matrix/app/v1/transactions/1");

	let resp = f.appservice.respond(&Method::PUT, &path, None, transaction_body()).await;
	assert_eq!(resp.status(), StatusCode::FORBIDDEN);
	assert_eq!(errcode(resp).await, "M_FORBIDDEN");

	let resp = f
		.appservice
		.respond(&Method::PUT, &path, Some("Bearer nope"), transaction_body())
		.await;
	assert_eq!(resp.status(), StatusCode::FORBIDDEN);
	assert!(drain(&mut f.events).is_empty());
}

#[tokio::test]
async fn query_token_and_legacy_path_are_accepted() {
	let mut f = fixture();
	let resp = f
		.appservice
		.respond(
			&Method::PUT,
			&uri("/transactions/7?access_token=hs-secret"),
			None,
			transaction_body(),
		)
		.await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(drain(&mut f.events).len(), 2);
}

#[tokio::test]
async fn duplicate_transaction_is_acknowledged_once() {
	let mut f = fixture();
	let path = uri("/_matrix/app/v1/transactions/abc");

	for _ in 0..3 {
		let resp = f.appservice.respond(&Method::PUT, &path, BEARER, transaction_body()).await;
		assert_eq!(resp.status(), StatusCode::OK);
	}
	assert_eq!(drain(&mut f.events).len(), 2);
}

#[tokio::test]
async fn concurrent_retry_of_a_queued_transaction_is_delivered_once() {
	let (tx, mut rx) = mpsc::channel(1);
	let appservice = Arc::new(Appservice::new(config(), tx, Arc::new(FakeMatrix::default())));
	let put = |appservice: Arc<Appservice>| {
		tokio::spawn(async move {
			appservice
				.respond(&Method::PUT, &uri("/_matrix/app/v1/transactions/t1"), BEARER, transaction_body())
				.await
				.status()
		})
	};

	// The first PUT blocks on the full queue while the retry arrives.
	let first = put(Arc::clone(&appservice));
	let retry = put(Arc::clone(&appservice));
	for _ in 0..8 {
		tokio::task::yield_now().await;
	}
	assert!(!first.is_finished());
	assert!(!retry.is_finished());

	let collector = tokio::spawn(async move {
		let mut delivered = 0;
		while rx.recv().await.is_some() {
			delivered += 1;
		}
		delivered
	});

	assert_eq!(first.await.unwrap(), StatusCode::OK);
	assert_eq!(retry.await.unwrap(), StatusCode::OK);
	drop(appservice);
	assert_eq!(collector.await.unwrap(), 2);
}

#[tokio::test]
async fn retry_waiting_on_a_failed_delivery_is_unavailable() {
	let (tx, rx) = mpsc::channel(1);
	let appservice = Arc::new(Appservice::new(config(), tx, Arc::new(FakeMatrix::default())));
	let put = |appservice: Arc<Appservice>| {
		tokio::spawn(async move {
			appservice
				.respond(&Method::PUT, &uri("/_matrix/app/v1/transactions/t2"), BEARER, transaction_body())
				.await
				.status()
		})
	};

	let first = put(Arc::clone(&appservice));
	let retry = put(Arc::clone(&appservice));
	for _ in 0..8 {
		tokio::task::yield_now().await;
	}
	drop(rx);

	assert_eq!(first.await.unwrap(), StatusCode::SERVICE_UNAVAILABLE);
	assert_eq!(retry.await.unwrap(), StatusCode::SERVICE_UNAVAILABLE);

	// The id was released, so a later attempt is processed again rather than acknowledged.
	let resp = appservice
		.respond(&Method::PUT, &uri("/_matrix/app/v1/transactions/t2"), BEARER, transaction_body())
		.await;
	assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn old_transaction_ids_are_forgotten() {
	let mut f = fixture();
	for txn in ["a", "b", "c"] {
		let path = uri(&format!("/_matrix/app/v1/transactions/{txn}"));
		f.appservice.respond(&Method::PUT, &path, BEARER, transaction_body()).await;
	}
	assert_eq!(drain(&mut f.events).len(), 6);

	// Only the two most recent ids are remembered.
	let again = uri("/_matrix/app/v1/transactions/a");
	f.appservice.respond(&Method::PUT, &again, BEARER, transaction_body()).await;
	assert_eq!(drain(&mut f.events).len(), 2);
}

#[tokio::test]
async fn malformed_body_is_rejected_and_not_remembered() {
	let mut f = fixture();
	let path = uri("/_matrix/app/v1/transactions/9");

	let resp = f
		.appservice
		.respond(&Method::PUT, &path, BEARER, Bytes::from_static(b"{not json"))
		.await;
	assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

	let resp = f.appservice.respond(&Method::PUT, &path, BEARER, transaction_body()).await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(drain(&mut f.events).len(), 2);
}

#[tokio::test]
async fn closed_queue_is_unavailable() {
	let f = fixture();
	drop(f.events);
	let resp = f
		.appservice
		.respond(&Method::PUT, &uri("/_matrix/app/v1/transactions/1"), BEARER, transaction_body())
		.await;
	assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn user_query_provisions_puppets_only() {
	let f = fixture();

	let resp = f
		.appservice
		.respond(
			&Method::GET,
			&uri("/_matrix/app/v1/users/%40twitch_carol%3Aexample.org"),
			BEARER,
			Bytes::new(),
		)
		.await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(f.matrix.puppets.lock().clone(), vec!["twitch_carol".to_string()]);

	for other in [
		"/_matrix/app/v1/users/@alice:example.org",
		"/_matrix/app/v1/users/@twitch_carol:elsewhere.org",
		"/_matrix/app/v1/users/@twitch_:example.org",
	] {
		let resp = f.appservice.respond(&Method::GET, &uri(other), BEARER, Bytes::new()).await;
		assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{other}");
	}
	assert_eq!(f.matrix.puppets.lock().len(), 1);
}

#[tokio::test]
async fn room_alias_query_is_not_found() {
	let f = fixture();
	let resp = f
		.appservice
		.respond(
			&Method::GET,
			&uri("/_matrix/app/v1/rooms/%23twitch_chan1%3Aexample.org"),
			BEARER,
			Bytes::new(),
		)
		.await;
	assert_eq!(resp.status(), StatusCode::NOT_FOUND);
	assert_eq!(errcode(resp).await, "M_NOT_FOUND");
}

#[tokio::test]
async fn wrong_method_on_transactions() {
	let f = fixture();
	let resp = f
		.appservice
		.respond(&Method::POST, &uri("/_matrix/app/v1/transactions/1"), BEARER, transaction_body())
		.await;
	assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
}
