use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::BodyExt;
use wiremock::matchers::path_regex;
use wiremock::{Mock, MockServer, ResponseTemplate};

use iceberg::client::Client;
use iceberg::config;
use iceberg::http::{Body, Method, Request, StatusCode};
use iceberg::proxy::gateway::Gateway;
use iceberg::router::default_route_table;

/// Registers the YAML's resources and serves the default table on an
/// ephemeral port.
async fn serve(yaml: &str) -> SocketAddr {
	let (_, spec) = config::parse(yaml).expect("config parses");
	config::bootstrap(&spec).await.expect("resources register");
	let gateway = Gateway::bind("127.0.0.1:0").await.expect("bind");
	let addr = gateway.local_addr().unwrap();
	tokio::spawn(async move {
		let _ = gateway.serve(default_route_table()).await;
	});
	addr
}

async fn send(gw: SocketAddr, method: Method, path: &str, body: &str) -> (StatusCode, ::http::HeaderMap, Bytes) {
	let req: Request = ::http::Request::builder()
		.method(method)
		.uri(format!("http://{gw}{path}"))
		.body(Body::from(body.to_string()))
		.unwrap();
	let res = Client::new().simple_call(req).await.expect("request succeeds");
	let (parts, body) = res.into_parts();
	let bytes = body.collect().await.unwrap().to_bytes();
	(parts.status, parts.headers, bytes)
}

#[tokio::test(flavor = "multi_thread")]
async fn proxies_a_route_end_to_end() {
	let backend = MockServer::start().await;
	Mock::given(path_regex("/.*"))
		.respond_with(
			ResponseTemplate::new(200)
				.set_body_string("hello from upstream")
				.insert_header("x-upstream", "yes"),
		)
		.mount(&backend)
		.await;

	let gw = serve(&format!(
		r#"
apiVersion: apps/v1
metadata: {{name: e2e}}
spec:
  listen: "127.0.0.1:0"
  resources:
    basic:
      frontend: /e2e/basic
      backend: {backend}
      method: GET
"#,
		backend = backend.uri()
	))
	.await;

	let (status, headers, body) = send(gw, Method::GET, "/e2e/basic", "").await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body, Bytes::from("hello from upstream"));
	assert_eq!(headers.get("x-upstream").unwrap(), "yes");
	assert!(headers.contains_key("x-request-id"));
}

#[tokio::test(flavor = "multi_thread")]
async fn literal_routes_beat_placeholder_routes() {
	let literal = MockServer::start().await;
	Mock::given(path_regex("/.*"))
		.respond_with(ResponseTemplate::new(200).set_body_string("literal"))
		.mount(&literal)
		.await;
	let placeholder = MockServer::start().await;
	Mock::given(path_regex("/.*"))
		.respond_with(ResponseTemplate::new(200).set_body_string("placeholder"))
		.mount(&placeholder)
		.await;

	let gw = serve(&format!(
		r#"
apiVersion: apps/v1
spec:
  listen: "127.0.0.1:0"
  resources:
    exact:
      frontend: /e2e/pick/a/b
      backend: {literal}
      method: GET
    wild:
      frontend: /e2e/pick/a/:x
      backend: {placeholder}
      method: GET
"#,
		literal = literal.uri(),
		placeholder = placeholder.uri()
	))
	.await;

	let (_, _, body) = send(gw, Method::GET, "/e2e/pick/a/b", "").await;
	assert_eq!(body, Bytes::from("literal"));
	let (_, _, body) = send(gw, Method::GET, "/e2e/pick/a/c", "").await;
	assert_eq!(body, Bytes::from("placeholder"));
}

#[tokio::test(flavor = "multi_thread")]
async fn continue_on_error_filters_do_not_mask_the_backend() {
	let screen = MockServer::start().await;
	Mock::given(path_regex("/.*"))
		.respond_with(
			ResponseTemplate::new(500)
				.insert_header("x-continue-on-error", "true")
				.set_body_string("screen failed"),
		)
		.mount(&screen)
		.await;
	let backend = MockServer::start().await;
	Mock::given(path_regex("/.*"))
		.respond_with(ResponseTemplate::new(200).set_body_string("backend-wins"))
		.mount(&backend)
		.await;

	let gw = serve(&format!(
		r#"
apiVersion: apps/v1
spec:
  listen: "127.0.0.1:0"
  resources:
    tolerant:
      frontend: /e2e/tolerant
      backend: {backend}
      method: GET
      filters:
        - name: screen
          addr: {screen}
          level: request
"#,
		backend = backend.uri(),
		screen = screen.uri()
	))
	.await;

	let (status, _, body) = send(gw, Method::GET, "/e2e/tolerant", "").await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body, Bytes::from("backend-wins"));
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_filters_short_circuit_the_route() {
	let screen = MockServer::start().await;
	Mock::given(path_regex("/.*"))
		.respond_with(ResponseTemplate::new(401).set_body_string("no token"))
		.mount(&screen)
		.await;
	let backend = MockServer::start().await;
	Mock::given(path_regex("/.*"))
		.respond_with(ResponseTemplate::new(200).set_body_string("unreachable"))
		.mount(&backend)
		.await;

	let gw = serve(&format!(
		r#"
apiVersion: apps/v1
spec:
  listen: "127.0.0.1:0"
  resources:
    guarded:
      frontend: /e2e/guarded
      backend: {backend}
      method: GET
      filters:
        - name: screen
          addr: {screen}
          level: request
"#,
		backend = backend.uri(),
		screen = screen.uri()
	))
	.await;

	let (status, _, body) = send(gw, Method::GET, "/e2e/guarded", "").await;
	assert_eq!(status, StatusCode::UNAUTHORIZED);
	assert_ne!(body, Bytes::from("unreachable"));
	assert_eq!(backend.received_requests().await.unwrap().len(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn awaited_parallel_filters_project_their_headers() {
	let slow = MockServer::start().await;
	Mock::given(path_regex("/.*"))
		.respond_with(
			ResponseTemplate::new(200)
				.insert_header("x-audit", "A")
				.set_delay(std::time::Duration::from_millis(50)),
		)
		.mount(&slow)
		.await;
	let fast = MockServer::start().await;
	Mock::given(path_regex("/.*"))
		.respond_with(ResponseTemplate::new(200).set_delay(std::time::Duration::from_millis(10)))
		.mount(&fast)
		.await;
	let join = MockServer::start().await;
	Mock::given(path_regex("/.*"))
		.respond_with(ResponseTemplate::new(200))
		.mount(&join)
		.await;
	let backend = MockServer::start().await;
	Mock::given(path_regex("/.*"))
		.respond_with(ResponseTemplate::new(200).set_body_string("payload"))
		.mount(&backend)
		.await;

	let gw = serve(&format!(
		r#"
apiVersion: apps/v1
spec:
  listen: "127.0.0.1:0"
  resources:
    joined:
      frontend: /e2e/joined
      backend: {backend}
      method: GET
      filters:
        - name: slow
          addr: {slow}
          level: request
          async: true
        - name: fast
          addr: {fast}
          level: request
          async: true
        - name: join
          addr: {join}
          level: response
          await: [slow, fast]
          exchange:
            headers: [x-audit]
"#,
		backend = backend.uri(),
		slow = slow.uri(),
		fast = fast.uri(),
		join = join.uri()
	))
	.await;

	let (status, headers, body) = send(gw, Method::GET, "/e2e/joined", "").await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body, Bytes::from("payload"));
	assert_eq!(headers.get("x-audit").unwrap(), "A");
}

#[tokio::test(flavor = "multi_thread")]
async fn await_deadlines_fail_with_gateway_timeout() {
	let slow = MockServer::start().await;
	Mock::given(path_regex("/.*"))
		.respond_with(ResponseTemplate::new(200).set_delay(std::time::Duration::from_millis(300)))
		.mount(&slow)
		.await;
	let join = MockServer::start().await;
	Mock::given(path_regex("/.*"))
		.respond_with(ResponseTemplate::new(200))
		.mount(&join)
		.await;
	let backend = MockServer::start().await;
	Mock::given(path_regex("/.*"))
		.respond_with(ResponseTemplate::new(200))
		.mount(&backend)
		.await;

	let gw = serve(&format!(
		r#"
apiVersion: apps/v1
spec:
  listen: "127.0.0.1:0"
  resources:
    impatient:
      frontend: /e2e/impatient
      backend: {backend}
      method: GET
      filters:
        - name: slow
          addr: {slow}
          level: request
          async: true
        - name: join
          addr: {join}
          level: response
          timeout: 10ms
          await: [slow]
"#,
		backend = backend.uri(),
		slow = slow.uri(),
		join = join.uri()
	))
	.await;

	let (status, _, _) = send(gw, Method::GET, "/e2e/impatient", "").await;
	assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test(flavor = "multi_thread")]
async fn cors_default_answers_preflight_and_exposes_headers() {
	let backend = MockServer::start().await;
	Mock::given(path_regex("/.*"))
		.respond_with(ResponseTemplate::new(200).set_body_string("ok"))
		.mount(&backend)
		.await;

	let gw = serve(&format!(
		r#"
apiVersion: apps/v1
spec:
  listen: "127.0.0.1:0"
  resources:
    open:
      frontend: /e2e/open
      backend: {backend}
      method: GET
      use:
        cors: default
"#,
		backend = backend.uri()
	))
	.await;

	let (status, headers, _) = send(gw, Method::OPTIONS, "/e2e/open", "").await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");

	let (_, headers, _) = send(gw, Method::GET, "/e2e/open", "").await;
	assert!(headers.contains_key("access-control-expose-headers"));
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_routes_are_not_found() {
	let backend = MockServer::start().await;
	let gw = serve(&format!(
		r#"
apiVersion: apps/v1
spec:
  listen: "127.0.0.1:0"
  resources:
    lonely:
      frontend: /e2e/lonely
      backend: {backend}
      method: GET
"#,
		backend = backend.uri()
	))
	.await;

	let (status, _, _) = send(gw, Method::GET, "/e2e/absent/route/very/deep", "").await;
	assert_eq!(status, StatusCode::NOT_FOUND);
}
