//! Walking multi-page collections.
//!
//! The first page's `href` tells where it started (`offset`) and how large it
//! was (`limit`). The remaining pages are requested concurrently through the
//! [`Limiter`]; a page that fails is logged and skipped.

use futures::stream::{self, Stream, StreamExt};
use serde_json::Value as JsonValue;

use crate::decode::parse_paging_href;
use crate::limiter::{ErrorPolicy, Limiter};
use crate::{ApiResult, Params, SpfyError};

/// Largest page the API serves.
pub const MAX_PAGE_SIZE: u64 = 50;

/// Page size assumed when the first page's `href` carries no `limit`.
pub const DEFAULT_HREF_LIMIT: u64 = 20;

/// Parameter sets for the pages after the first one.
///
/// Yields `offset`s strictly increasing by `page_size`, all below `total`.
#[derive(Clone, Debug, PartialEq)]
pub struct PaginationCursor {
    base_url: String,
    params: Params,
    next_offset: u64,
    page_size: u64,
    total: u64,
}

impl PaginationCursor {
    /// `None` unless the page has `next`, `href` and `total`.
    ///
    /// `page_size` defaults to and is capped at [`MAX_PAGE_SIZE`].
    pub fn from_result(page: &ApiResult, page_size: Option<u64>) -> Option<Self> {
        page.next_url()?;
        let total = page.total()?;
        let href = parse_paging_href(page.href()?)?;
        let limit = href.limit.unwrap_or(DEFAULT_HREF_LIMIT);
        let offset = href.offset.unwrap_or(0);
        Some(Self {
            base_url: href.base_url,
            params: href.params,
            next_offset: offset.saturating_add(limit),
            page_size: page_size.unwrap_or(MAX_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
            total,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Offsets still to be requested.
    pub fn offsets(&self) -> Vec<u64> {
        std::iter::successors(Some(self.next_offset), |offset| {
            offset.checked_add(self.page_size)
        })
        .take_while(|offset| *offset < self.total)
        .collect()
    }
}

impl Iterator for PaginationCursor {
    type Item = Params;

    fn next(&mut self) -> Option<Params> {
        if self.next_offset >= self.total {
            return None;
        }
        let offset = self.next_offset;
        self.next_offset = offset.saturating_add(self.page_size);
        Some(
            self.params
                .clone()
                .set("limit", self.page_size)
                .set("offset", offset),
        )
    }
}

/// Items of `first` followed by the items of every remaining page.
///
/// Item order is kept within a page; pages arrive as they complete.
pub fn paginate(first: &ApiResult, page_size: Option<u64>) -> impl Stream<Item = JsonValue> + Send {
    let head = stream::iter(first.items().to_vec());

    let cursor = PaginationCursor::from_result(first, page_size);
    let rest = match (cursor, first.client()) {
        (Some(cursor), Some(client)) => {
            let limit = client.options().page_concurrency;
            let base_url = cursor.base_url().to_owned();
            tracing::debug!(
                base_url = %base_url,
                total = cursor.total(),
                page_size = cursor.page_size(),
                limit,
                "paginating"
            );
            let pages = cursor.map(move |params| {
                let client = client.clone();
                let url = base_url.clone();
                async move { client.get(&url, params).await }
            });

            Limiter::<SpfyError>::new(limit)
                .with_policy(ErrorPolicy::ignore_all())
                .run(pages)
                .filter_map(|outcome| async move {
                    match outcome {
                        Ok(decoded) => Some(stream::iter(decoded.into_items())),
                        Err(err) => {
                            tracing::error!(error = %err, "pagination aborted");
                            err.in_flight.abort_all();
                            None
                        }
                    }
                })
                .flatten()
                .left_stream()
        }
        (Some(_), None) => {
            tracing::warn!("issuing client dropped; only the first page is available");
            stream::empty().right_stream()
        }
        (None, _) => stream::empty().right_stream(),
    };

    head.chain(rest)
}

impl ApiResult {
    /// Lazily walks this page and all following ones.
    pub fn paginate(&self, page_size: Option<u64>) -> impl Stream<Item = JsonValue> + Send {
        paginate(self, page_size)
    }

    /// Collects every item of the collection.
    pub async fn all(&self, page_size: Option<u64>) -> Vec<JsonValue> {
        self.paginate(page_size).collect().await
    }
}
