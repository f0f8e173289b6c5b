use bytes::Bytes;
use http_body_util::BodyExt;

use crate::http::{Body, HeaderName, HeaderValue, Method, Request, Uri};

pub fn request_for_uri(uri: &str) -> Request {
	request(uri, Method::GET, &[], "")
}

pub fn request(uri: &str, method: Method, headers: &[(&str, &str)], body: &str) -> Request {
	let mut rb = ::http::Request::builder()
		.uri(uri.parse::<Uri>().unwrap())
		.method(method);
	for (name, value) in headers {
		rb = rb.header(
			HeaderName::try_from(name.to_string()).unwrap(),
			HeaderValue::from_str(value).unwrap(),
		);
	}
	rb.body(Body::from(body.to_string())).unwrap()
}

pub async fn read_body(body: Body) -> Bytes {
	body.collect().await.unwrap().to_bytes()
}
