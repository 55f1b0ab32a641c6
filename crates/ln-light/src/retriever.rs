use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{OdrBackend, OdrError, OdrRequest, OdrResponse};

/// Default bound on a single retrieval.
pub const DEFAULT_RETRIEVAL_TIMEOUT: Duration = Duration::from_secs(10);

/// How a retrieval ended, reported to the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalOutcome {
    Served,
    Failed,
    TimedOut,
    Cancelled,
}

pub type RetrievalObserver = Arc<dyn Fn(RetrievalOutcome) + Send + Sync>;

/// Totals since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrieverStats {
    pub requests: u64,
    pub timeouts: u64,
    pub cancellations: u64,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    timeouts: AtomicU64,
    cancellations: AtomicU64,
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bounds every on-demand retrieval by a timeout and the caller's
/// cancellation token.  The request future runs inline and is dropped on
/// either, so nothing outlives the call.
pub struct Retriever {
    backend: Arc<dyn OdrBackend>,
    timeout: Duration,
    in_flight: AtomicUsize,
    counters: Counters,
    observer: Option<RetrievalObserver>,
}

impl Retriever {
    pub fn new(backend: Arc<dyn OdrBackend>) -> Self {
        Self {
            backend,
            timeout: DEFAULT_RETRIEVAL_TIMEOUT,
            in_flight: AtomicUsize::new(0),
            counters: Counters::default(),
            observer: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_observer(mut self, observer: RetrievalObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Retrievals currently waiting on the network.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> RetrieverStats {
        RetrieverStats {
            requests: self.counters.requests.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            cancellations: self.counters.cancellations.load(Ordering::Relaxed),
        }
    }

    pub async fn retrieve(&self, token: &CancellationToken, request: OdrRequest) -> Result<OdrResponse, OdrError> {
        if token.is_cancelled() {
            self.record(RetrievalOutcome::Cancelled);
            return Err(OdrError::Cancelled);
        }
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        let _guard = InFlight::enter(&self.in_flight);
        trace!(?request, "Retrieving on demand");

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(OdrError::Cancelled),
            res = tokio::time::timeout(self.timeout, self.backend.retrieve(&request)) => {
                res.unwrap_or(Err(OdrError::Timeout))
            }
        };
        let outcome = match &result {
            Ok(_) => RetrievalOutcome::Served,
            Err(OdrError::Cancelled) => RetrievalOutcome::Cancelled,
            Err(OdrError::Timeout) => RetrievalOutcome::TimedOut,
            Err(_) => RetrievalOutcome::Failed,
        };
        if outcome != RetrievalOutcome::Served {
            debug!(?request, ?outcome, "On-demand retrieval did not complete");
        }
        self.record(outcome);
        result
    }

    fn record(&self, outcome: RetrievalOutcome) {
        match outcome {
            RetrievalOutcome::TimedOut => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            RetrievalOutcome::Cancelled => {
                self.counters.cancellations.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        if let Some(observer) = &self.observer {
            observer(outcome);
        }
    }
}
