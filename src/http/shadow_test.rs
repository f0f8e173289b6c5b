use bytes::Bytes;

use crate::http::shadow::{RequestOption, ShadowRequest, ShadowResponse};
use crate::http::tests_common::*;
use crate::http::{Body, HeaderMap, HeaderValue, Method, StatusCode, Uri, header};

#[tokio::test]
async fn clones_share_the_body_buffer() {
	let req = request("http://a/x", Method::POST, &[("x-a", "1")], "hello world");
	let shadow = ShadowRequest::new(req).await.unwrap();
	for _ in 0..3 {
		let clone = shadow.clone_request(&[]);
		assert_eq!(read_body(clone.into_body()).await, Bytes::from("hello world"));
	}
	assert_eq!(shadow.body_bytes(), &Bytes::from("hello world"));
}

#[tokio::test]
async fn clone_headers_are_independent() {
	let req = request("http://a/x", Method::GET, &[("x-a", "1")], "");
	let shadow = ShadowRequest::new(req).await.unwrap();
	let mut clone = shadow.clone_request(&[]);
	clone.headers_mut().insert("x-a", HeaderValue::from_static("2"));
	clone.headers_mut().insert("x-b", HeaderValue::from_static("3"));
	assert_eq!(shadow.headers().get("x-a").unwrap(), "1");
	assert!(!shadow.headers().contains_key("x-b"));
}

#[tokio::test]
async fn with_uri_retargets_but_keeps_the_path() {
	let req = request("http://frontend/api/items?q=1", Method::PUT, &[], "");
	let shadow = ShadowRequest::new(req).await.unwrap();
	let target: Uri = "http://backend:8080/ignored".parse().unwrap();
	let clone = shadow.clone_request(&[RequestOption::WithUri(target)]);
	assert_eq!(clone.uri().authority().unwrap().as_str(), "backend:8080");
	assert_eq!(clone.uri().path(), "/api/items");
	assert_eq!(clone.uri().query(), Some("q=1"));
	assert_eq!(clone.method(), Method::PUT);
}

#[tokio::test]
async fn with_method_overrides_the_clone() {
	let req = request_for_uri("http://a/x");
	let shadow = ShadowRequest::new(req).await.unwrap();
	let clone = shadow.clone_request(&[RequestOption::WithMethod(Method::DELETE)]);
	assert_eq!(clone.method(), Method::DELETE);
	assert_eq!(shadow.method(), Method::GET);
}

#[tokio::test]
async fn replace_body_repoints_the_buffer() {
	let req = request("http://a/x", Method::POST, &[], "before");
	let mut shadow = ShadowRequest::new(req).await.unwrap();
	shadow.replace_body(Bytes::from("after"));
	let clone = shadow.clone_request(&[]);
	assert_eq!(read_body(clone.into_body()).await, Bytes::from("after"));
}

#[tokio::test]
async fn parse_form_merges_query_and_urlencoded_body() {
	let req = request(
		"http://a/x?a=1&a=2",
		Method::POST,
		&[("content-type", "application/x-www-form-urlencoded")],
		"b=3",
	);
	let mut shadow = ShadowRequest::new(req).await.unwrap();
	shadow.parse_form();
	let form = shadow.form().unwrap();
	assert_eq!(form["a"], vec!["1", "2"]);
	assert_eq!(form["b"], vec!["3"]);
}

#[tokio::test]
async fn response_lifts_into_a_request() {
	let mut res = ::http::Response::builder()
		.status(StatusCode::CREATED)
		.header("x-upstream", "yes")
		.body(Body::from("payload"))
		.unwrap();
	res.headers_mut().append("x-upstream", HeaderValue::from_static("also"));
	let shadow = ShadowResponse::new(res).await.unwrap();
	let lifted = shadow.create_request();
	let values: Vec<_> = lifted.headers().get_all("x-upstream").iter().collect();
	assert_eq!(values.len(), 2);
	assert_eq!(lifted.body_bytes(), &Bytes::from("payload"));
	assert_eq!(lifted.uri(), &Uri::default());
}

#[tokio::test]
async fn write_strips_content_length_and_replays_the_buffer() {
	let res = ::http::Response::builder()
		.status(StatusCode::OK)
		.header(header::CONTENT_LENGTH, "999")
		.body(Body::from("abc"))
		.unwrap();
	let shadow = ShadowResponse::new(res).await.unwrap();
	let out = shadow.write();
	assert!(!out.headers().contains_key(header::CONTENT_LENGTH));
	assert_eq!(read_body(out.into_body()).await, Bytes::from("abc"));
}

#[test]
fn from_parts_builds_without_io() {
	let shadow = ShadowRequest::from_parts(
		Method::POST,
		"http://a/b".parse().unwrap(),
		HeaderMap::new(),
		Bytes::from("x"),
	);
	assert_eq!(shadow.body_bytes(), &Bytes::from("x"));
	assert_eq!(shadow.method(), Method::POST);
}
