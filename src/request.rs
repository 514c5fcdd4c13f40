use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;

use crate::{Params, Result, SpfyError};

/// Request payload.
#[derive(Clone, Debug, PartialEq)]
pub enum Body {
    /// Serialized as JSON with `Content-Type: application/json`.
    Json(serde_json::Value),
    /// Sent verbatim, e.g. a base64 JPEG for cover uploads.
    Raw { content_type: String, data: Vec<u8> },
}

impl Body {
    pub fn json(value: serde_json::Value) -> Self {
        Self::Json(value)
    }

    pub fn raw(content_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self::Raw {
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    pub fn content_type(&self) -> &str {
        match self {
            Self::Json(_) => "application/json",
            Self::Raw { content_type, .. } => content_type,
        }
    }

    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Self::Json(value) => serde_json::to_vec(value)
                .map_err(|err| SpfyError::Decode(format!("cannot serialize request body: {err}"))),
            Self::Raw { data, .. } => Ok(data.clone()),
        }
    }
}

/// One logical API call: method, URL, query, body and extra headers.
///
/// Relative URLs are resolved against the client's base URL.
#[derive(Clone, Debug)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub params: Params,
    pub body: Option<Body>,
    pub headers: HeaderMap,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            params: Params::default(),
            body: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::PUT, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    pub fn params<P: Into<Params>>(mut self, params: P) -> Self {
        self.params = params.into();
        self
    }

    pub fn body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    pub fn json(self, value: serde_json::Value) -> Self {
        self.body(Body::Json(value))
    }

    /// Adds a header; invalid names or values are rejected.
    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| SpfyError::Config(format!("invalid header name '{name}': {err}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|err| SpfyError::Config(format!("invalid header value for '{name}': {err}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use reqwest::Method;
    use serde_json::json;

    use crate::{ApiRequest, Body, SpfyError};

    #[test]
    fn builders_set_method_and_body() {
        let request = ApiRequest::put("me/player/play").json(json!({"uris": ["spotify:track:1"]}));
        assert_eq!(request.method, Method::PUT);
        assert_eq!(request.body.as_ref().map(Body::content_type), Some("application/json"));
        assert_eq!(
            request.body.expect("body").to_bytes().expect("serializable"),
            br#"{"uris":["spotify:track:1"]}"#.to_vec()
        );
    }

    #[test]
    fn header_rejects_invalid_name() {
        let err = ApiRequest::get("me").header("bad header", "x").expect_err("must fail");
        assert!(matches!(err, SpfyError::Config(_)));
    }

    #[test]
    fn raw_body_is_sent_verbatim() {
        let body = Body::raw("image/jpeg", b"aGVsbG8=".to_vec());
        assert_eq!(body.content_type(), "image/jpeg");
        assert_eq!(body.to_bytes().expect("raw"), b"aGVsbG8=".to_vec());
    }
}
