use crate::http::HeaderName;
use crate::http::shadow::{ShadowRequest, ShadowResponse};

#[cfg(test)]
#[path = "updaters_test.rs"]
mod tests;

/// Field-level projections from one shadow request onto another.
///
/// `Update*` variants copy only the listed keys, overwriting those keys and
/// nothing else; a key absent from the source leaves the target's value
/// untouched. `Replace*` variants discard the target's field and clone the
/// source's wholesale.
#[derive(Debug, Clone)]
pub enum RequestUpdater {
	UpdateHeader(Vec<HeaderName>),
	UpdateTrailer(Vec<HeaderName>),
	ReplaceHeader,
	ReplaceTrailer,
	ReplaceBody,
	ReplaceForm,
	ReplaceUri,
	ReplaceMultipartForm,
}

impl RequestUpdater {
	pub fn apply(&self, dst: &mut ShadowRequest, src: &ShadowRequest) {
		match self {
			RequestUpdater::UpdateHeader(keys) => {
				for key in keys {
					if !src.headers().contains_key(key) {
						continue;
					}
					let values: Vec<_> = src.headers().get_all(key).iter().cloned().collect();
					dst.headers_mut().remove(key);
					for value in values {
						dst.headers_mut().append(key.clone(), value);
					}
				}
			},
			RequestUpdater::UpdateTrailer(keys) => {
				for key in keys {
					if !src.trailers().contains_key(key) {
						continue;
					}
					let values: Vec<_> = src.trailers().get_all(key).iter().cloned().collect();
					dst.trailers_mut().remove(key);
					for value in values {
						dst.trailers_mut().append(key.clone(), value);
					}
				}
			},
			RequestUpdater::ReplaceHeader => *dst.headers_mut() = src.headers().clone(),
			RequestUpdater::ReplaceTrailer => *dst.trailers_mut() = src.trailers().clone(),
			RequestUpdater::ReplaceBody => dst.replace_body(src.body_bytes().clone()),
			RequestUpdater::ReplaceForm => dst.set_form(src.form().cloned()),
			RequestUpdater::ReplaceUri => *dst.uri_mut() = src.uri().clone(),
			RequestUpdater::ReplaceMultipartForm => dst.set_multipart(src.multipart().cloned()),
		}
	}
}

/// The response-side family; identical update/replace semantics.
#[derive(Debug, Clone)]
pub enum ResponseUpdater {
	UpdateHeader(Vec<HeaderName>),
	UpdateTrailer(Vec<HeaderName>),
	ReplaceHeader,
	ReplaceTrailer,
	ReplaceBody,
}

impl ResponseUpdater {
	pub fn apply(&self, dst: &mut ShadowResponse, src: &ShadowResponse) {
		match self {
			ResponseUpdater::UpdateHeader(keys) => {
				for key in keys {
					if !src.headers().contains_key(key) {
						continue;
					}
					let values: Vec<_> = src.headers().get_all(key).iter().cloned().collect();
					dst.headers_mut().remove(key);
					for value in values {
						dst.headers_mut().append(key.clone(), value);
					}
				}
			},
			ResponseUpdater::UpdateTrailer(keys) => {
				for key in keys {
					if !src.trailers().contains_key(key) {
						continue;
					}
					let values: Vec<_> = src.trailers().get_all(key).iter().cloned().collect();
					dst.trailers_mut().remove(key);
					for value in values {
						dst.trailers_mut().append(key.clone(), value);
					}
				}
			},
			ResponseUpdater::ReplaceHeader => *dst.headers_mut() = src.headers().clone(),
			ResponseUpdater::ReplaceTrailer => *dst.trailers_mut() = src.trailers().clone(),
			ResponseUpdater::ReplaceBody => dst.replace_body(src.body_bytes().clone()),
		}
	}
}

pub fn update_request(dst: &mut ShadowRequest, src: &ShadowRequest, updaters: &[RequestUpdater]) {
	for updater in updaters {
		updater.apply(dst, src);
	}
}

pub fn update_response(dst: &mut ShadowResponse, src: &ShadowResponse, updaters: &[ResponseUpdater]) {
	for updater in updaters {
		updater.apply(dst, src);
	}
}
