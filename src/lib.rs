//! `spfy-http` is the async request pipeline of a Spotify Web API client.
//!
//! Every call goes through [`SpfyClient::execute`], which adds:
//! - ETag revalidation backed by a pluggable [`CacheStore`]
//! - waiting out rate limits (`429`, `5xx`) and busy playback devices
//! - a one-time token refresh for client-credentials sessions
//!
//! Paged collections are walked concurrently with [`ApiResult::paginate`],
//! bounded by the [`Limiter`].

mod auth;
mod cache;
mod client;
mod decode;
mod error;
mod limiter;
mod options;
mod paginate;
mod params;
#[cfg(feature = "redis")]
mod redis_store;
mod request;
mod result;
mod retry;
mod usage;
mod value;
mod wire;

pub use auth::{AuthFlow, AuthProvider, BearerToken, ClientCredentials, Credentials, DEFAULT_TOKEN_URL};
pub use cache::{CacheEntry, CacheKey, CacheStore, EtagCache, MemoryStore};
pub use client::SpfyClient;
pub use error::{ErrorKind, ErrorResponse, SpfyError};
pub use limiter::{
    limited_as_completed, ErrorPolicy, InFlight, Limiter, SchedulerError, TaskFailure,
};
pub use options::{CallOptions, ClientOptions, DEFAULT_BASE_URL};
pub use paginate::{paginate, PaginationCursor, DEFAULT_HREF_LIMIT, MAX_PAGE_SIZE};
pub use params::Params;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
pub use request::{ApiRequest, Body};
pub use result::{ApiResult, CollectionKey, Decoded};
pub use retry::{RetryPolicy, RetryTrigger, TransportBackoff};
pub use usage::{MemoryUsageCounter, UsageCounter, UsageStats};
pub use value::ParamValue;

pub type Result<T> = std::result::Result<T, SpfyError>;
