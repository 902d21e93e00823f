use super::events::GateEvent;
use crate::gate::DecisionReason;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tower::Service;

/// A telemetry sink that consumes gate events.
pub trait GateSink:
    tower::Service<GateEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: GateEvent)
where
    S: tower::Service<GateEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// A sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<GateEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: GateEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl GateSink for NullSink {
    type SinkError = Infallible;
}

/// A sink that logs events through the `tracing` crate.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<GateEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: GateEvent) -> Self::Future {
        match &event {
            GateEvent::StoreUnavailable { .. } => tracing::warn!(event = %event, "gate_event"),
            _ => tracing::debug!(event = %event, "gate_event"),
        }
        Box::pin(async { Ok(()) })
    }
}

impl GateSink for LogSink {
    type SinkError = Infallible;
}

/// A bounded ring of recent events, mainly for tests and dashboards.
///
/// Keeps the newest `capacity` events; older ones are evicted from the front
/// and counted. Accessors summarize the ring by outcome so assertions don't
/// have to pattern-match the event enum.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<GateEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// A sink keeping the most recent 1024 events.
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// A sink keeping the most recent `capacity` events (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The retained events, oldest first.
    pub fn events(&self) -> Vec<GateEvent> {
        self.lock().iter().cloned().collect()
    }

    /// Retained admission events.
    pub fn admitted(&self) -> usize {
        self.lock()
            .iter()
            .filter(|event| matches!(event, GateEvent::Admitted { .. }))
            .count()
    }

    /// Retained denial events with the given reason.
    pub fn denied_with(&self, reason: DecisionReason) -> usize {
        self.lock()
            .iter()
            .filter(|event| matches!(event, GateEvent::Denied { reason: r, .. } if *r == reason))
            .count()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events dropped from the front once capacity was reached.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<GateEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<GateEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: GateEvent) -> Self::Future {
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            guard.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(event);
        Box::pin(async { Ok(()) })
    }
}

impl GateSink for MemorySink {
    type SinkError = Infallible;
}

/// Offloads event delivery to a bounded channel and worker task, so a slow
/// downstream sink never stalls admission.
#[derive(Clone)]
pub struct NonBlockingSink {
    tx: tokio::sync::mpsc::Sender<GateEvent>,
    dropped: Arc<AtomicU64>,
}

impl NonBlockingSink {
    /// Spawn the worker and return the sending handle.
    ///
    /// Events that arrive while the channel is full are counted and dropped.
    /// Must be called from within a tokio runtime.
    pub fn with_capacity<S>(sink: S, capacity: usize) -> Self
    where
        S: tower::Service<GateEvent, Response = ()> + Send + Clone + 'static,
        S::Error: std::error::Error + Send + 'static,
        S::Future: Send + 'static,
    {
        let (tx, mut rx) = tokio::sync::mpsc::channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));

        let mut worker_sink = sink;
        tokio::spawn(async move {
            use tower::ServiceExt;
            while let Some(event) = rx.recv().await {
                if let Ok(ready) = worker_sink.ready().await {
                    let _ = ready.call(event).await;
                }
            }
        });

        Self { tx, dropped }
    }

    /// Events dropped because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for NonBlockingSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonBlockingSink")
            .field("dropped", &self.dropped())
            .finish_non_exhaustive()
    }
}

impl Service<GateEvent> for NonBlockingSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: GateEvent) -> Self::Future {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Box::pin(async { Ok(()) })
    }
}

impl GateSink for NonBlockingSink {
    type SinkError = Infallible;
}
