//! Retry decisions for one logical call.
//!
//! Four triggers are tracked separately: rate limiting (unbounded, waits the
//! server's `Retry-After`), busy devices (fixed delay, bounded by the call's
//! retry count), expired credentials (one re-authentication under the
//! client-credentials flow) and transient transport failures (bounded
//! exponential backoff with jitter).

use std::time::Duration;

use rand::Rng;

use crate::{AuthFlow, CallOptions, ClientOptions, ErrorKind, SpfyError};

/// Exponential backoff for transient transport failures.
///
/// Delay is `min(initial * multiplier^attempt, max)`, plus up to 25% jitter
/// when enabled, never exceeding `max`.
#[derive(Clone, Debug, PartialEq)]
pub struct TransportBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: bool,
    /// Retries after the first attempt.
    pub max_retries: u32,
}

impl Default for TransportBackoff {
    fn default() -> Self {
        Self::from_options(&ClientOptions::default())
    }
}

impl TransportBackoff {
    pub fn from_options(opts: &ClientOptions) -> Self {
        Self {
            initial: Duration::from_millis(opts.retry_backoff_ms),
            max: Duration::from_millis(opts.retry_backoff_max_ms),
            multiplier: 2.0,
            jitter: opts.retry_jitter,
            max_retries: opts.transport_retries,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(16) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exp);
        let base = Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max)
            .min(self.max);
        if !self.jitter {
            return base;
        }
        let factor = rand::thread_rng().gen_range(0.0..=0.25);
        base.saturating_add(base.mul_f64(factor)).min(self.max)
    }
}

/// Client-wide retry settings.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub busy_delay: Duration,
    pub transport: TransportBackoff,
}

impl RetryPolicy {
    pub fn from_options(opts: &ClientOptions) -> Self {
        Self {
            busy_delay: opts.busy_retry_delay(),
            transport: TransportBackoff::from_options(opts),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_options(&ClientOptions::default())
    }
}

/// Which trigger produced a wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryTrigger {
    RateLimit,
    DeviceBusy,
    Transport,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum RetryDecision {
    Wait(Duration, RetryTrigger),
    Reauthenticate,
    Surface,
}

/// Per-call retry budgets. Budgets only ever count down.
#[derive(Debug)]
pub(crate) struct RetryState<'a> {
    policy: &'a RetryPolicy,
    busy_remaining: u32,
    transport_remaining: u32,
    transport_attempt: u32,
    reauth_remaining: u32,
    last_error: Option<ErrorKind>,
}

impl<'a> RetryState<'a> {
    pub(crate) fn new(policy: &'a RetryPolicy, call: &CallOptions) -> Self {
        Self {
            policy,
            busy_remaining: call.retries,
            transport_remaining: policy.transport.max_retries,
            transport_attempt: 0,
            reauth_remaining: 1,
            last_error: None,
        }
    }

    pub(crate) fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    pub(crate) fn decide(&mut self, err: &SpfyError, flow: AuthFlow) -> RetryDecision {
        self.last_error = Some(err.kind());
        match err {
            SpfyError::RateLimited { retry_after, .. } => {
                RetryDecision::Wait(*retry_after, RetryTrigger::RateLimit)
            }
            SpfyError::DeviceUnavailable(_) if self.busy_remaining > 0 => {
                self.busy_remaining -= 1;
                RetryDecision::Wait(self.policy.busy_delay, RetryTrigger::DeviceBusy)
            }
            SpfyError::TokenExpired
                if flow == AuthFlow::ClientCredentials && self.reauth_remaining > 0 =>
            {
                self.reauth_remaining -= 1;
                RetryDecision::Reauthenticate
            }
            SpfyError::Transport(inner)
                if is_transient(inner) && self.transport_remaining > 0 =>
            {
                self.transport_remaining -= 1;
                let delay = self.policy.transport.delay(self.transport_attempt);
                self.transport_attempt += 1;
                RetryDecision::Wait(delay, RetryTrigger::Transport)
            }
            _ => RetryDecision::Surface,
        }
    }
}

/// Transport failures worth another attempt.
pub(crate) fn is_transient(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reqwest::header::HeaderMap;

    use super::{RetryDecision, RetryPolicy, RetryState, RetryTrigger, TransportBackoff};
    use crate::{AuthFlow, CallOptions, ErrorKind, ErrorResponse, SpfyError};

    fn busy() -> SpfyError {
        SpfyError::DeviceUnavailable(Box::new(ErrorResponse {
            status: 202,
            url: "https://api/v1/me/player/play".to_owned(),
            headers: HeaderMap::new(),
            body: String::new(),
        }))
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            busy_delay: Duration::from_millis(5),
            transport: TransportBackoff {
                initial: Duration::from_millis(100),
                max: Duration::from_secs(1),
                multiplier: 2.0,
                jitter: false,
                max_retries: 2,
            },
        }
    }

    #[test]
    fn rate_limit_never_exhausts_and_keeps_busy_budget() {
        let policy = fast_policy();
        let mut state = RetryState::new(&policy, &CallOptions::device(1));
        let limited = SpfyError::RateLimited {
            status: 429,
            retry_after: Duration::from_secs(2),
        };

        for _ in 0..100 {
            assert_eq!(
                state.decide(&limited, AuthFlow::AuthorizationCode),
                RetryDecision::Wait(Duration::from_secs(2), RetryTrigger::RateLimit)
            );
        }
        assert_eq!(
            state.decide(&busy(), AuthFlow::AuthorizationCode),
            RetryDecision::Wait(Duration::from_millis(5), RetryTrigger::DeviceBusy)
        );
        assert_eq!(
            state.decide(&busy(), AuthFlow::AuthorizationCode),
            RetryDecision::Surface
        );
    }

    #[test]
    fn device_busy_is_bounded_by_call_retries() {
        let policy = fast_policy();
        let mut state = RetryState::new(&policy, &CallOptions::device(2));
        let decisions: Vec<_> = (0..3)
            .map(|_| state.decide(&busy(), AuthFlow::AuthorizationCode))
            .collect();
        assert!(matches!(decisions[0], RetryDecision::Wait(_, RetryTrigger::DeviceBusy)));
        assert!(matches!(decisions[1], RetryDecision::Wait(_, RetryTrigger::DeviceBusy)));
        assert_eq!(decisions[2], RetryDecision::Surface);
        assert_eq!(state.last_error(), Some(ErrorKind::DeviceUnavailable));
    }

    #[test]
    fn expired_token_reauthenticates_once_under_client_credentials() {
        let policy = fast_policy();
        let mut state = RetryState::new(&policy, &CallOptions::default());
        assert_eq!(
            state.decide(&SpfyError::TokenExpired, AuthFlow::ClientCredentials),
            RetryDecision::Reauthenticate
        );
        assert_eq!(
            state.decide(&SpfyError::TokenExpired, AuthFlow::ClientCredentials),
            RetryDecision::Surface
        );
    }

    #[test]
    fn expired_token_surfaces_under_user_flow() {
        let policy = fast_policy();
        let mut state = RetryState::new(&policy, &CallOptions::default());
        assert_eq!(
            state.decide(&SpfyError::TokenExpired, AuthFlow::AuthorizationCode),
            RetryDecision::Surface
        );
    }

    #[test]
    fn terminal_errors_surface() {
        let policy = fast_policy();
        let mut state = RetryState::new(&policy, &CallOptions::default());
        assert_eq!(
            state.decide(&SpfyError::AuthRequired, AuthFlow::ClientCredentials),
            RetryDecision::Surface
        );
        assert_eq!(
            state.decide(&SpfyError::Decode("bad".to_owned()), AuthFlow::ClientCredentials),
            RetryDecision::Surface
        );
    }

    #[tokio::test]
    async fn connection_refused_backs_off_then_surfaces() {
        let err = reqwest::Client::new()
            .get("http://127.0.0.1:1/")
            .send()
            .await
            .expect_err("nothing listens on port 1");
        let err = SpfyError::Transport(err);

        let policy = fast_policy();
        let mut state = RetryState::new(&policy, &CallOptions::default());
        assert_eq!(
            state.decide(&err, AuthFlow::AuthorizationCode),
            RetryDecision::Wait(Duration::from_millis(100), RetryTrigger::Transport)
        );
        assert_eq!(
            state.decide(&err, AuthFlow::AuthorizationCode),
            RetryDecision::Wait(Duration::from_millis(200), RetryTrigger::Transport)
        );
        assert_eq!(
            state.decide(&err, AuthFlow::AuthorizationCode),
            RetryDecision::Surface
        );
    }

    #[test]
    fn backoff_grows_and_caps() {
        let backoff = TransportBackoff {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: false,
            max_retries: 3,
        };
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        assert_eq!(backoff.delay(3), Duration::from_millis(500));
        assert_eq!(backoff.delay(40), Duration::from_millis(500));
    }

    #[test]
    fn huge_backoff_saturates_at_max() {
        let backoff = TransportBackoff {
            initial: Duration::from_millis(u64::MAX / 2),
            max: Duration::MAX,
            multiplier: 2.0,
            jitter: true,
            max_retries: 20,
        };
        assert_eq!(backoff.delay(16), Duration::MAX);

        let capped = TransportBackoff {
            max: Duration::from_secs(30),
            ..backoff
        };
        assert_eq!(capped.delay(16), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let backoff = TransportBackoff {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
            max_retries: 3,
        };
        for _ in 0..50 {
            let delay = backoff.delay(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(125));
        }
    }
}
