use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_tungstenite::tungstenite::Message;

use super::{Frame, frame_parts, make_frame, run_frame};
use crate::cascade::{Caller, Level, Verdict};
use crate::http::shadow::ShadowRequest;
use crate::http::{Body, HeaderMap, Method, Uri, x_headers};
use crate::proxy::GatewayError;
use crate::router::RouteValues;

fn template() -> ShadowRequest {
	ShadowRequest::from_parts(
		Method::GET,
		Uri::from_static("http://gw/socket"),
		HeaderMap::new(),
		Bytes::new(),
	)
}

struct FrameCaller {
	body: &'static str,
	message_type: Option<&'static str>,
}

#[async_trait]
impl Caller for FrameCaller {
	fn level(&self) -> Level {
		Level::REQUEST
	}

	fn name(&self) -> &str {
		"frame"
	}

	async fn call(
		&self,
		_rv: &RouteValues,
		current: &ShadowRequest,
		_original: &ShadowRequest,
	) -> Result<Verdict, GatewayError> {
		// the synthesized request must carry the frame payload and its type
		assert!(current.headers().contains_key(x_headers::MESSAGE_TYPE));
		let mut rb = ::http::Response::builder();
		if let Some(t) = self.message_type {
			rb = rb.header(x_headers::MESSAGE_TYPE, t);
		}
		Ok(Verdict::Continue(Some(
			rb.body(Body::from(self.body.to_string())).unwrap(),
		)))
	}
}

#[test]
fn frames_split_into_payload_and_type() {
	match frame_parts(&Message::text("hi")) {
		Frame::Data(payload, kind) => {
			assert_eq!(payload, Bytes::from("hi"));
			assert_eq!(kind, "text");
		},
		_ => panic!("expected data frame"),
	}
	match frame_parts(&Message::binary(vec![1u8, 2])) {
		Frame::Data(payload, kind) => {
			assert_eq!(payload, Bytes::from(vec![1u8, 2]));
			assert_eq!(kind, "binary");
		},
		_ => panic!("expected data frame"),
	}
	assert!(matches!(frame_parts(&Message::Close(None)), Frame::Close));
	assert!(matches!(frame_parts(&Message::Ping(Bytes::new())), Frame::Control));
}

#[test]
fn frames_rebuild_with_their_type() {
	assert!(matches!(make_frame(Bytes::from("a"), "text"), Message::Text(_)));
	assert!(matches!(make_frame(Bytes::from("a"), "binary"), Message::Binary(_)));
}

#[tokio::test]
async fn no_callers_forwards_unchanged() {
	let out = run_frame(&template(), &[], Bytes::from("raw"), "binary").await.unwrap();
	assert!(out.is_none());
}

#[tokio::test]
async fn caller_rewrites_the_payload() {
	let callers: Vec<Arc<dyn Caller>> = vec![Arc::new(FrameCaller {
		body: "TRANSFORMED",
		message_type: None,
	})];
	let out = run_frame(&template(), &callers, Bytes::from("raw"), "binary")
		.await
		.unwrap()
		.unwrap();
	match out {
		Message::Binary(data) => assert_eq!(data, Bytes::from("TRANSFORMED")),
		other => panic!("unexpected frame {other:?}"),
	}
}

#[tokio::test]
async fn caller_can_rewrite_the_message_type() {
	let callers: Vec<Arc<dyn Caller>> = vec![Arc::new(FrameCaller {
		body: "now text",
		message_type: Some("text"),
	})];
	let out = run_frame(&template(), &callers, Bytes::from("raw"), "binary")
		.await
		.unwrap()
		.unwrap();
	assert!(matches!(out, Message::Text(_)));
}
