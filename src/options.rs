use std::str::FromStr;
use std::time::Duration;

use crate::{Result, SpfyError};

pub const DEFAULT_BASE_URL: &str = "https://api.spotify.com/v1/";

/// Configures timeouts, caching, pagination and retry behavior.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientOptions {
    /// Prefix for relative request URLs.
    pub base_url: String,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Lifetime of ETag cache entries, refreshed on every hit.
    pub cache_ttl_secs: u64,
    /// Maximum number of page requests in flight while paginating.
    pub page_concurrency: usize,
    /// Fixed wait between device-busy (HTTP 202) retries.
    pub busy_retry_delay_ms: u64,
    /// Retries after the first attempt for transient transport failures.
    pub transport_retries: u32,
    /// Base transport backoff in milliseconds (exponential strategy).
    pub retry_backoff_ms: u64,
    /// Upper bound for a single transport backoff.
    pub retry_backoff_max_ms: u64,
    /// Randomize transport backoff delays.
    pub retry_jitter: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_owned(),
            timeout_ms: 10_000,
            cache_ttl_secs: 3_600,
            page_concurrency: 8,
            busy_retry_delay_ms: 5_000,
            transport_retries: 2,
            retry_backoff_ms: 250,
            retry_backoff_max_ms: 10_000,
            retry_jitter: true,
        }
    }
}

impl ClientOptions {
    /// Reads overrides from the environment on top of the defaults.
    ///
    /// Recognized variables: `SPFY_BASE_URL`, `SPFY_TIMEOUT_MS`,
    /// `SPFY_CACHE_TTL_SECS`, `SPFY_PAGE_CONCURRENCY`,
    /// `SPFY_BUSY_RETRY_DELAY_MS`, `SPFY_TRANSPORT_RETRIES`,
    /// `SPFY_RETRY_BACKOFF_MS`, `SPFY_RETRY_BACKOFF_MAX_MS`,
    /// `SPFY_RETRY_JITTER`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut opts = Self::default();
        if let Some(base_url) = lookup("SPFY_BASE_URL") {
            if base_url.trim().is_empty() {
                return Err(SpfyError::Config("SPFY_BASE_URL is set but empty".to_owned()));
            }
            opts.base_url = base_url.trim().to_owned();
        }
        override_parsed(&lookup, "SPFY_TIMEOUT_MS", &mut opts.timeout_ms)?;
        override_parsed(&lookup, "SPFY_CACHE_TTL_SECS", &mut opts.cache_ttl_secs)?;
        override_parsed(&lookup, "SPFY_PAGE_CONCURRENCY", &mut opts.page_concurrency)?;
        override_parsed(&lookup, "SPFY_BUSY_RETRY_DELAY_MS", &mut opts.busy_retry_delay_ms)?;
        override_parsed(&lookup, "SPFY_TRANSPORT_RETRIES", &mut opts.transport_retries)?;
        override_parsed(&lookup, "SPFY_RETRY_BACKOFF_MS", &mut opts.retry_backoff_ms)?;
        override_parsed(&lookup, "SPFY_RETRY_BACKOFF_MAX_MS", &mut opts.retry_backoff_max_ms)?;
        override_parsed(&lookup, "SPFY_RETRY_JITTER", &mut opts.retry_jitter)?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_concurrency == 0 {
            return Err(SpfyError::Config("page_concurrency must be at least 1".to_owned()));
        }
        if self.timeout_ms == 0 {
            return Err(SpfyError::Config("timeout_ms must be greater than 0".to_owned()));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn busy_retry_delay(&self) -> Duration {
        Duration::from_millis(self.busy_retry_delay_ms)
    }
}

fn override_parsed<F, T>(lookup: &F, name: &str, slot: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(name) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|err| SpfyError::Config(format!("invalid {name} '{raw}': {err}")))?;
    }
    Ok(())
}

/// Per-call switches for [`crate::SpfyClient::execute`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CallOptions {
    /// Treat HTTP 202 as "device busy" and poll.
    pub check_device_busy: bool,
    /// Device-busy retries after the first attempt.
    pub retries: u32,
    /// Bump the bound user's API usage counter.
    pub increment_usage: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            check_device_busy: false,
            retries: 5,
            increment_usage: false,
        }
    }
}

impl CallOptions {
    /// Options for player endpoints that answer 202 while the device wakes up.
    pub fn device(retries: u32) -> Self {
        Self {
            check_device_busy: true,
            retries,
            ..Self::default()
        }
    }

    pub fn counted(mut self) -> Self {
        self.increment_usage = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{CallOptions, ClientOptions};
    use crate::SpfyError;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn env_overrides_defaults() {
        let opts = ClientOptions::from_lookup(lookup(&[
            ("SPFY_BASE_URL", "http://localhost:8080/v1/"),
            ("SPFY_PAGE_CONCURRENCY", "3"),
            ("SPFY_RETRY_JITTER", "false"),
        ]))
        .expect("valid env");
        assert_eq!(opts.base_url, "http://localhost:8080/v1/");
        assert_eq!(opts.page_concurrency, 3);
        assert!(!opts.retry_jitter);
        assert_eq!(opts.timeout_ms, ClientOptions::default().timeout_ms);
    }

    #[test]
    fn env_rejects_garbage() {
        let err = ClientOptions::from_lookup(lookup(&[("SPFY_TIMEOUT_MS", "soon")]))
            .expect_err("must fail");
        assert!(matches!(err, SpfyError::Config(_)));
    }

    #[test]
    fn zero_concurrency_is_invalid() {
        let err = ClientOptions::from_lookup(lookup(&[("SPFY_PAGE_CONCURRENCY", "0")]))
            .expect_err("must fail");
        assert!(matches!(err, SpfyError::Config(_)));
    }

    #[test]
    fn device_call_options() {
        let opts = CallOptions::device(2).counted();
        assert!(opts.check_device_busy);
        assert_eq!(opts.retries, 2);
        assert!(opts.increment_usage);
        assert_eq!(CallOptions::default().retries, 5);
    }
}
