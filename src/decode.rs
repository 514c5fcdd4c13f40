use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};

use crate::{Params, Result, SpfyError};

/// Parses a response body; empty and `null` bodies decode to `None`.
pub(crate) fn decode_body(text: &str) -> Result<Option<serde_json::Value>> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(None);
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|err| SpfyError::Decode(format!("invalid response JSON: {err}; body: {text}")))
}

/// `Retry-After` in whole seconds; absent or unparsable means no wait.
pub(crate) fn retry_after(headers: &HeaderMap) -> Duration {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::ZERO)
}

/// `href` without its query string and fragment.
pub(crate) fn strip_query(href: &str) -> Option<String> {
    let mut url = url::Url::parse(href).ok()?;
    url.set_query(None);
    url.set_fragment(None);
    Some(url.into())
}

/// Splits a paging `href` into its base URL, `limit`, `offset` and the
/// remaining query parameters.
pub(crate) struct PagingHref {
    pub base_url: String,
    pub params: Params,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

pub(crate) fn parse_paging_href(href: &str) -> Option<PagingHref> {
    let url = url::Url::parse(href).ok()?;
    let mut params = Params::new();
    let mut limit = None;
    let mut offset = None;
    for (name, value) in url.query_pairs() {
        match name.as_ref() {
            "limit" => limit = value.parse().ok(),
            "offset" => offset = value.parse().ok(),
            _ => params = params.set(name.into_owned(), value.into_owned()),
        }
    }
    Some(PagingHref {
        base_url: strip_query(href)?,
        params,
        limit,
        offset,
    })
}
