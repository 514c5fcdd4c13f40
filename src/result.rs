use std::fmt;
use std::sync::OnceLock;

use serde_json::Value as JsonValue;

use crate::client::WeakClient;
use crate::decode::strip_query;
use crate::{Result, SpfyClient, SpfyError};

/// Keys under which the API nests collections, in lookup order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CollectionKey {
    Items,
    Artists,
    Tracks,
    Albums,
    AudioFeatures,
    Playlists,
    Devices,
}

impl CollectionKey {
    pub const ALL: [CollectionKey; 7] = [
        Self::Items,
        Self::Artists,
        Self::Tracks,
        Self::Albums,
        Self::AudioFeatures,
        Self::Playlists,
        Self::Devices,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Items => "items",
            Self::Artists => "artists",
            Self::Tracks => "tracks",
            Self::Albums => "albums",
            Self::AudioFeatures => "audio_features",
            Self::Playlists => "playlists",
            Self::Devices => "devices",
        }
    }
}

/// Outcome of a successful call.
#[derive(Clone, Debug)]
pub enum Decoded {
    /// 2xx with an empty or `null` body.
    Empty,
    Result(ApiResult),
}

impl Decoded {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn result(&self) -> Option<&ApiResult> {
        match self {
            Self::Empty => None,
            Self::Result(result) => Some(result),
        }
    }

    pub fn into_result(self) -> Option<ApiResult> {
        match self {
            Self::Empty => None,
            Self::Result(result) => Some(result),
        }
    }

    pub fn value(&self) -> Option<&JsonValue> {
        self.result().map(ApiResult::value)
    }

    /// Collection items, empty for [`Decoded::Empty`].
    pub fn into_items(self) -> Vec<JsonValue> {
        self.into_result().map(ApiResult::into_items).unwrap_or_default()
    }
}

/// A decoded response body plus a weak handle to the client that fetched it.
///
/// Collections are found under the first [`CollectionKey`] present, either
/// as a plain array or as a paging object with an `items` array.
#[derive(Clone)]
pub struct ApiResult {
    value: JsonValue,
    client: WeakClient,
    base_url: OnceLock<Option<String>>,
}

impl fmt::Debug for ApiResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiResult")
            .field("value", &self.value)
            .field("client_alive", &self.client.is_alive())
            .finish()
    }
}

impl PartialEq for ApiResult {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl ApiResult {
    pub(crate) fn new(value: JsonValue, client: WeakClient) -> Self {
        Self {
            value,
            client,
            base_url: OnceLock::new(),
        }
    }

    /// A result not tied to any client; it can be inspected but not paged.
    pub fn detached(value: JsonValue) -> Self {
        Self::new(value, WeakClient::default())
    }

    pub fn value(&self) -> &JsonValue {
        &self.value
    }

    pub fn into_value(self) -> JsonValue {
        self.value
    }

    /// Top-level field.
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.value.get(key)
    }

    /// The issuing client, if it is still alive.
    pub fn client(&self) -> Option<SpfyClient> {
        self.client.upgrade()
    }

    pub fn collection(&self) -> Option<CollectionKey> {
        CollectionKey::ALL
            .into_iter()
            .find(|key| collection_items(self.value.get(key.as_str())).is_some())
    }

    pub fn items(&self) -> &[JsonValue] {
        self.collection()
            .and_then(|key| collection_items(self.value.get(key.as_str())))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn item(&self, index: usize) -> Option<&JsonValue> {
        self.items().get(index)
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, JsonValue> {
        self.items().iter()
    }

    pub fn into_items(mut self) -> Vec<JsonValue> {
        let Some(key) = self.collection() else {
            return Vec::new();
        };
        let slot = match self.value.get_mut(key.as_str()) {
            Some(JsonValue::Object(map)) => map.get_mut("items"),
            other => other,
        };
        match slot.map(JsonValue::take) {
            Some(JsonValue::Array(items)) => items,
            _ => Vec::new(),
        }
    }

    /// The object carrying `href`/`next`/`total`: the top level when it is
    /// itself a page, otherwise the paging object under the collection key.
    fn paging(&self) -> Option<&serde_json::Map<String, JsonValue>> {
        let top = self.value.as_object()?;
        if top.get("items").is_some_and(JsonValue::is_array) {
            return Some(top);
        }
        self.collection()
            .and_then(|key| top.get(key.as_str()))
            .and_then(JsonValue::as_object)
            .or(Some(top))
    }

    fn paging_str(&self, field: &str) -> Option<&str> {
        self.paging()?.get(field)?.as_str()
    }

    pub fn href(&self) -> Option<&str> {
        self.paging_str("href")
    }

    pub fn next_url(&self) -> Option<&str> {
        self.paging_str("next")
    }

    pub fn previous_url(&self) -> Option<&str> {
        self.paging_str("previous")
    }

    pub fn total(&self) -> Option<u64> {
        self.paging()?.get("total")?.as_u64()
    }

    /// `href` without query string, computed on first use.
    pub fn base_url(&self) -> Option<&str> {
        self.base_url
            .get_or_init(|| self.href().and_then(strip_query))
            .as_deref()
    }

    /// Fetches the page behind `next`, if any.
    pub async fn next_page(&self) -> Result<Option<ApiResult>> {
        self.follow(self.next_url()).await
    }

    /// Fetches the page behind `previous`, if any.
    pub async fn previous_page(&self) -> Result<Option<ApiResult>> {
        self.follow(self.previous_url()).await
    }

    async fn follow(&self, url: Option<&str>) -> Result<Option<ApiResult>> {
        let Some(url) = url else {
            return Ok(None);
        };
        let client = self.client().ok_or(SpfyError::ClientDropped)?;
        Ok(client.get(url, ()).await?.into_result())
    }
}

fn collection_items(value: Option<&JsonValue>) -> Option<&Vec<JsonValue>> {
    match value? {
        JsonValue::Array(items) => Some(items),
        JsonValue::Object(map) => map.get("items")?.as_array(),
        _ => None,
    }
}
