//! Bounded-concurrency scheduler yielding results in completion order.
//!
//! Operations come from a lazy source of futures. At most `limit` of them
//! run at a time; each one is spawned on the tokio runtime, and when one
//! finishes the next future from the source is started before the finished
//! result is handed out.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::stream::{self, FuturesUnordered, Stream, StreamExt};
use tokio::task::{JoinError, JoinHandle};

/// What to do with a failed operation.
pub enum ErrorPolicy<E> {
    /// Stop the stream and surface the error.
    Propagate,
    /// Log and skip failures the predicate accepts; propagate the rest.
    Ignore(Arc<dyn Fn(&E) -> bool + Send + Sync>),
}

impl<E> ErrorPolicy<E> {
    pub fn ignore_matching<P>(predicate: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Self::Ignore(Arc::new(predicate))
    }

    pub fn ignore_all() -> Self {
        Self::ignore_matching(|_| true)
    }

    fn ignores(&self, error: &E) -> bool {
        match self {
            Self::Propagate => false,
            Self::Ignore(predicate) => predicate(error),
        }
    }
}

impl<E> Clone for ErrorPolicy<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Propagate => Self::Propagate,
            Self::Ignore(predicate) => Self::Ignore(Arc::clone(predicate)),
        }
    }
}

impl<E> fmt::Debug for ErrorPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Propagate => f.write_str("Propagate"),
            Self::Ignore(_) => f.write_str("Ignore(<predicate>)"),
        }
    }
}

/// Why a scheduled operation failed.
#[derive(Debug)]
pub enum TaskFailure<E> {
    /// The operation returned an error.
    Operation(E),
    /// The task panicked or was aborted.
    Join(JoinError),
}

impl<E: fmt::Display> fmt::Display for TaskFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Operation(err) => err.fmt(f),
            Self::Join(err) => write!(f, "operation did not complete: {err}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for TaskFailure<E> {}

/// Handles to operations that were still running when the stream stopped.
///
/// Dropping this detaches the tasks; call [`InFlight::abort_all`] to cancel.
pub struct InFlight<T, E> {
    handles: Vec<JoinHandle<Result<T, E>>>,
}

impl<T, E> InFlight<T, E> {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Number of operations that have not finished yet.
    pub fn pending(&self) -> usize {
        self.handles.iter().filter(|handle| !handle.is_finished()).count()
    }

    pub fn abort_all(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }

    pub fn into_handles(self) -> Vec<JoinHandle<Result<T, E>>> {
        self.handles
    }

    /// Waits for every operation, tolerating cancellation.
    pub async fn join_all(self) -> Vec<Result<Result<T, E>, JoinError>> {
        let mut outcomes = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            outcomes.push(handle.await);
        }
        outcomes
    }
}

impl<T, E> fmt::Debug for InFlight<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlight")
            .field("len", &self.handles.len())
            .field("pending", &self.pending())
            .finish()
    }
}

/// An unignored failure together with the operations still running beside it.
pub struct SchedulerError<T, E> {
    pub failure: TaskFailure<E>,
    pub in_flight: InFlight<T, E>,
}

impl<T, E> SchedulerError<T, E> {
    pub fn into_failure(self) -> TaskFailure<E> {
        self.failure
    }
}

impl<T, E: fmt::Debug> fmt::Debug for SchedulerError<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerError")
            .field("failure", &self.failure)
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

impl<T, E: fmt::Display> fmt::Display for SchedulerError<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} operation(s) still in flight)",
            self.failure,
            self.in_flight.len()
        )
    }
}

impl<T, E: fmt::Debug + fmt::Display> std::error::Error for SchedulerError<T, E> {}

/// Bounded-concurrency completion scheduler.
#[derive(Clone, Debug)]
pub struct Limiter<E> {
    limit: usize,
    policy: ErrorPolicy<E>,
}

impl<E> Limiter<E>
where
    E: fmt::Display + Send + 'static,
{
    /// `limit` below 1 is treated as 1.
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            policy: ErrorPolicy::Propagate,
        }
    }

    pub fn with_policy(mut self, policy: ErrorPolicy<E>) -> Self {
        self.policy = policy;
        self
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Drives `source` and yields outcomes as operations complete.
    ///
    /// Nothing is started until the stream is first polled. After an
    /// unignored failure the stream yields that error once and then ends.
    pub fn run<I, F, T>(self, source: I) -> impl Stream<Item = Result<T, SchedulerError<T, E>>>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
    {
        let state = Scheduler {
            source: source.into_iter().fuse(),
            running: FuturesUnordered::new(),
            limit: self.limit,
            policy: self.policy,
            started: false,
            halted: false,
        };

        stream::unfold(state, |mut state| async move {
            if state.halted {
                return None;
            }
            if !state.started {
                state.started = true;
                state.backfill();
            }

            loop {
                let joined = state.running.next().await?;
                state.backfill();

                let failure = match joined {
                    Ok(Ok(value)) => return Some((Ok(value), state)),
                    Ok(Err(err)) if state.policy.ignores(&err) => {
                        tracing::warn!(error = %err, "ignoring failed operation");
                        continue;
                    }
                    Ok(Err(err)) => TaskFailure::Operation(err),
                    Err(err) => TaskFailure::Join(err),
                };

                state.halted = true;
                let in_flight = InFlight {
                    handles: std::mem::take(&mut state.running).into_iter().collect(),
                };
                return Some((Err(SchedulerError { failure, in_flight }), state));
            }
        })
    }
}

/// Shorthand for `Limiter::new(limit).run(source)` with the propagate policy.
pub fn limited_as_completed<I, F, T, E>(
    source: I,
    limit: usize,
) -> impl Stream<Item = Result<T, SchedulerError<T, E>>>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: fmt::Display + Send + 'static,
{
    Limiter::new(limit).run(source)
}

struct Scheduler<S, T, E> {
    source: std::iter::Fuse<S>,
    running: FuturesUnordered<JoinHandle<Result<T, E>>>,
    limit: usize,
    policy: ErrorPolicy<E>,
    started: bool,
    halted: bool,
}

impl<S, F, T, E> Scheduler<S, T, E>
where
    S: Iterator<Item = F>,
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    fn backfill(&mut self) {
        while self.running.len() < self.limit {
            match self.source.next() {
                Some(operation) => self.running.push(tokio::spawn(operation)),
                None => break,
            }
        }
    }
}
