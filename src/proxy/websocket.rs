use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use hyper_util::rt::TokioIo;
use tokio::sync::watch;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tracing::{debug, warn};

use crate::cascade::{Caller, Level, cascade, sort};
use crate::http::shadow::ShadowRequest;
use crate::http::{Body, HeaderValue, Request, Response, StatusCode, header, x_headers};
use crate::proxy::{GatewayError, Handler};
use crate::router::RouteValues;

#[cfg(test)]
#[path = "websocket_test.rs"]
mod tests;

/// Bridges a client WebSocket to a backend one. `connect`-level callers run
/// against the upgrade request; afterwards each direction pumps frames
/// through its own cascade (`request` level inbound, `response` level
/// outbound) until either socket closes.
pub struct WebSocketProxy {
	backend: url::Url,
	connect: Vec<Arc<dyn Caller>>,
	request: Vec<Arc<dyn Caller>>,
	response: Vec<Arc<dyn Caller>>,
}

impl WebSocketProxy {
	pub fn new(backend: url::Url, callers: Vec<Arc<dyn Caller>>) -> WebSocketProxy {
		let callers = sort(callers);
		let select = |level: Level| -> Vec<Arc<dyn Caller>> {
			callers
				.iter()
				.filter(|c| c.level().contains(level))
				.cloned()
				.collect()
		};
		WebSocketProxy {
			backend,
			connect: select(Level::CONNECT),
			request: select(Level::REQUEST),
			response: select(Level::RESPONSE),
		}
	}
}

#[async_trait]
impl Handler for WebSocketProxy {
	async fn handle(&self, mut req: Request, rv: RouteValues) -> Response {
		let Some(on_upgrade) = req.extensions_mut().remove::<hyper::upgrade::OnUpgrade>() else {
			return GatewayError::Internal("request is not upgradeable".to_string()).into_response();
		};
		let Some(key) = req.headers().get(header::SEC_WEBSOCKET_KEY).cloned() else {
			return GatewayError::Filter {
				status: StatusCode::BAD_REQUEST,
				message: "missing Sec-WebSocket-Key".to_string(),
			}
			.into_response();
		};

		let mut shadow = match ShadowRequest::new(req).await {
			Ok(shadow) => shadow,
			Err(err) => return GatewayError::internal(err).into_response(),
		};
		shadow.route_values = rv;
		match cascade(&mut shadow, &self.connect).await {
			Ok(None) => {},
			Ok(Some(out)) => return out.write(),
			Err(err) => return err.into_response(),
		}

		let accept = derive_accept_key(key.as_bytes());
		let backend = self.backend.clone();
		let template = shadow.clone_shadow();
		let request_callers = self.request.clone();
		let response_callers = self.response.clone();
		tokio::spawn(async move {
			let upgraded = match on_upgrade.await {
				Ok(upgraded) => upgraded,
				Err(err) => {
					warn!("client upgrade failed: {err}");
					return;
				},
			};
			let client = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
			let backend = match tokio_tungstenite::connect_async(backend.as_str()).await {
				Ok((stream, _)) => stream,
				Err(err) => {
					warn!("backend dial failed: {err}");
					return;
				},
			};
			let (client_sink, client_stream) = client.split();
			let (backend_sink, backend_stream) = backend.split();
			// Both directions observe one shared listening flag; whichever
			// loop exits first flips it and the other follows.
			let (listening, _) = watch::channel(true);
			let listening = Arc::new(listening);
			let inbound = pump(
				client_stream,
				backend_sink,
				template.clone_shadow(),
				request_callers,
				listening.clone(),
				"inbound",
			);
			let outbound = pump(
				backend_stream,
				client_sink,
				template,
				response_callers,
				listening,
				"outbound",
			);
			tokio::join!(inbound, outbound);
			debug!("websocket bridge closed");
		});

		::http::Response::builder()
			.status(StatusCode::SWITCHING_PROTOCOLS)
			.header(header::UPGRADE, "websocket")
			.header(header::CONNECTION, "Upgrade")
			.header(header::SEC_WEBSOCKET_ACCEPT, accept)
			.body(Body::empty())
			.expect("static response must build")
	}
}

enum Frame {
	Data(Bytes, &'static str),
	Control,
	Close,
}

fn frame_parts(msg: &Message) -> Frame {
	match msg {
		Message::Text(text) => Frame::Data(Bytes::copy_from_slice(text.as_bytes()), "text"),
		Message::Binary(data) => Frame::Data(data.clone(), "binary"),
		Message::Close(_) => Frame::Close,
		_ => Frame::Control,
	}
}

fn make_frame(payload: Bytes, kind: &str) -> Message {
	match kind {
		"text" => Message::text(String::from_utf8_lossy(&payload).into_owned()),
		_ => Message::binary(payload),
	}
}

/// Pumps frames in one direction. Each frame synthesizes a request carrying
/// the payload as body and its type in `Message-Type`, runs the direction's
/// cascade and forwards the (possibly transformed) payload. A cascade that
/// yields no response forwards the frame unchanged; a cascade error drops
/// the frame.
async fn pump<R, W>(
	mut from: R,
	mut to: W,
	template: ShadowRequest,
	callers: Vec<Arc<dyn Caller>>,
	listening: Arc<watch::Sender<bool>>,
	direction: &'static str,
) where
	R: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
	W: Sink<Message> + Unpin,
	W::Error: std::fmt::Display,
{
	let mut closed = listening.subscribe();
	loop {
		let msg = tokio::select! {
			msg = from.next() => msg,
			_ = closed.changed() => break,
		};
		let Some(Ok(msg)) = msg else { break };
		let (payload, kind) = match frame_parts(&msg) {
			Frame::Data(payload, kind) => (payload, kind),
			Frame::Control => continue,
			Frame::Close => break,
		};
		let forwarded = match run_frame(&template, &callers, payload.clone(), kind).await {
			Ok(Some(frame)) => frame,
			Ok(None) => make_frame(payload, kind),
			Err(err) => {
				warn!(direction, "frame cascade failed: {err}");
				continue;
			},
		};
		if let Err(err) = to.send(forwarded).await {
			debug!(direction, "peer write failed: {err}");
			break;
		}
	}
	let _ = listening.send(false);
}

async fn run_frame(
	template: &ShadowRequest,
	callers: &[Arc<dyn Caller>],
	payload: Bytes,
	kind: &'static str,
) -> Result<Option<Message>, GatewayError> {
	if callers.is_empty() {
		return Ok(None);
	}
	let mut req = template.clone_shadow();
	req.replace_body(payload);
	req
		.headers_mut()
		.insert(x_headers::MESSAGE_TYPE, HeaderValue::from_static(kind));
	let Some(res) = cascade(&mut req, callers).await? else {
		return Ok(None);
	};
	let kind = res
		.headers()
		.get(x_headers::MESSAGE_TYPE)
		.and_then(|v| v.to_str().ok())
		.map(|v| if v.eq_ignore_ascii_case("text") { "text" } else { "binary" })
		.unwrap_or(kind);
	Ok(Some(make_frame(res.body_bytes().clone(), kind)))
}
