//! Keyed burst coalescing.
//!
//! A [`CorrelationBuffer`] collects items that share a correlation key and
//! hands them to a [`FlushHandler`] once the key has been quiet for the
//! configured period (a trailing debounce per key). Items without a key are
//! delivered straight away as single-item groups.

pub mod handler;

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::{Mutex as TokioMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub use handler::{handler_fn, ErrorSink, FlushHandler, FnHandler, TracingSink};

use crate::error::{RelayError, Result};

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

/// One submitted item.
#[derive(Debug, Clone)]
pub struct Entry<T> {
    pub correlation_key: Option<String>,
    pub payload: T,
    /// Arrival index, unique and increasing across the whole buffer.
    pub sequence: u64,
    pub received_at: DateTime<Utc>,
}

/// A completed group, entries in arrival order.
#[derive(Debug, Clone)]
pub struct Group<T> {
    pub key: Option<String>,
    pub entries: Vec<Entry<T>>,
}

impl<T> Group<T> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&Entry<T>> {
        self.entries.last()
    }

    pub fn payloads(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|e| &e.payload)
    }

    pub fn into_payloads(self) -> Vec<T> {
        self.entries.into_iter().map(|e| e.payload).collect()
    }
}

/// Quiet period, consumer and error sink for a buffer.
pub struct FlushPolicy<T> {
    quiet_period: Duration,
    handler: Arc<dyn FlushHandler<T>>,
    sink: Arc<dyn ErrorSink>,
}

impl<T> FlushPolicy<T> {
    pub fn new<H>(quiet_period: Duration, handler: Arc<H>) -> Self
    where
        H: FlushHandler<T> + 'static,
    {
        Self {
            quiet_period,
            handler,
            sink: Arc::new(TracingSink),
        }
    }

    pub fn with_error_sink(mut self, sink: impl ErrorSink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Armed<T> {
    quiet_period: Duration,
    handler: Arc<dyn FlushHandler<T>>,
    sink: Arc<dyn ErrorSink>,
    runtime: Handle,
}

impl<T> Clone for Armed<T> {
    fn clone(&self) -> Self {
        Self {
            quiet_period: self.quiet_period,
            handler: Arc::clone(&self.handler),
            sink: Arc::clone(&self.sink),
            runtime: self.runtime.clone(),
        }
    }
}

struct PendingGroup<T> {
    items: Vec<Entry<T>>,
    /// Sequence of the newest entry. A timer armed for an older one is stale.
    generation: u64,
    timer: JoinHandle<()>,
}

struct State<T> {
    armed: Option<Armed<T>>,
    groups: HashMap<String, PendingGroup<T>>,
    /// One turn lock per key with a flush in progress; keeps flushes of the
    /// same key from overlapping.
    turns: HashMap<String, Arc<TokioMutex<()>>>,
    next_sequence: u64,
    in_flight: usize,
    closed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    drained: Notify,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish_delivery(&self, state: &mut State<T>) {
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.drained.notify_waiters();
        }
    }
}

// ---------------------------------------------------------------------------
// CorrelationBuffer
// ---------------------------------------------------------------------------

/// Debounce-by-key buffer. Cloning gives another handle to the same buffer.
pub struct CorrelationBuffer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for CorrelationBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> Default for CorrelationBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> CorrelationBuffer<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    armed: None,
                    groups: HashMap::new(),
                    turns: HashMap::new(),
                    next_sequence: 0,
                    in_flight: 0,
                    closed: false,
                }),
                drained: Notify::new(),
            }),
        }
    }

    /// Install the flush policy. Allowed exactly once, from inside a tokio
    /// runtime (flush timers are spawned onto it).
    pub fn configure(&self, policy: FlushPolicy<T>) -> Result<()> {
        if policy.quiet_period.is_zero() {
            return Err(RelayError::Config(
                "quiet period must be greater than zero".to_string(),
            ));
        }

        let runtime = Handle::try_current().map_err(|e| {
            RelayError::Config(format!("No tokio runtime available for flush timers: {e}"))
        })?;

        let mut state = self.shared.lock();
        if state.closed {
            return Err(RelayError::BufferClosed);
        }
        if state.armed.is_some() {
            return Err(RelayError::Config(
                "correlation buffer is already configured".to_string(),
            ));
        }

        state.armed = Some(Armed {
            quiet_period: policy.quiet_period,
            handler: policy.handler,
            sink: policy.sink,
            runtime,
        });

        info!(
            "Correlation buffer configured (quiet period {}ms)",
            policy.quiet_period.as_millis()
        );
        Ok(())
    }

    /// Add `payload` to the group for `key` and restart that group's quiet
    /// period. Returns the sequence number assigned to the item.
    ///
    /// A missing or blank key skips grouping: the item is handed to the
    /// consumer right away on its own task.
    pub fn submit(&self, key: Option<&str>, payload: T) -> Result<u64> {
        let key = key.filter(|k| !k.trim().is_empty());

        let mut state = self.shared.lock();
        if state.closed {
            return Err(RelayError::BufferClosed);
        }
        let armed = state.armed.clone().ok_or_else(|| {
            RelayError::Config("correlation buffer used before configure".to_string())
        })?;

        let sequence = state.next_sequence;
        state.next_sequence += 1;

        let entry = Entry {
            correlation_key: key.map(str::to_owned),
            payload,
            sequence,
            received_at: Utc::now(),
        };

        let Some(key) = key else {
            state.in_flight += 1;
            drop(state);

            debug!("Item {sequence} has no correlation key, delivering immediately");
            let group = Group {
                key: None,
                entries: vec![entry],
            };
            let shared = Arc::clone(&self.shared);
            let runtime = armed.runtime.clone();
            runtime.spawn(async move {
                run_consumer(&armed, group).await;
                let mut state = shared.lock();
                shared.finish_delivery(&mut state);
            });
            return Ok(sequence);
        };

        let timer = armed.runtime.spawn(flush_after(
            Arc::clone(&self.shared),
            key.to_owned(),
            sequence,
            armed.quiet_period,
        ));

        match state.groups.get_mut(key) {
            Some(pending) => {
                pending.timer.abort();
                pending.timer = timer;
                pending.generation = sequence;
                pending.items.push(entry);
                debug!("Group {key}: {} item(s) pending", pending.items.len());
            }
            None => {
                state.groups.insert(
                    key.to_owned(),
                    PendingGroup {
                        items: vec![entry],
                        generation: sequence,
                        timer,
                    },
                );
                debug!("Group {key}: opened");
            }
        }

        Ok(sequence)
    }

    /// Close the buffer and hand back every group that has not flushed yet,
    /// oldest first. The consumer is not called for them.
    ///
    /// Waits for deliveries that were already under way; once this returns
    /// the consumer will not be invoked again.
    pub async fn shutdown(&self) -> Vec<Group<T>> {
        let mut drained: Vec<Group<T>> = {
            let mut state = self.shared.lock();
            if !state.closed {
                info!(
                    "Shutting down correlation buffer ({} pending group(s))",
                    state.groups.len()
                );
            }
            state.closed = true;
            state
                .groups
                .drain()
                .map(|(key, pending)| {
                    pending.timer.abort();
                    Group {
                        key: Some(key),
                        entries: pending.items,
                    }
                })
                .collect()
        };
        drained.sort_by_key(|g| g.entries.first().map(|e| e.sequence));

        loop {
            let notified = self.shared.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let idle = self.shared.lock().in_flight == 0;
            if idle {
                break;
            }
            notified.await;
        }

        // Nothing can flush any more; let go of the consumer and whatever it holds.
        self.shared.lock().armed = None;

        drained
    }

    pub fn pending_groups(&self) -> usize {
        self.shared.lock().groups.len()
    }

    pub fn pending_keys(&self) -> Vec<String> {
        self.shared.lock().groups.keys().cloned().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

// ---------------------------------------------------------------------------
// Flush path
// ---------------------------------------------------------------------------

async fn flush_after<T: Send + 'static>(
    shared: Arc<Shared<T>>,
    key: String,
    generation: u64,
    quiet_period: Duration,
) {
    tokio::time::sleep(quiet_period).await;

    // Removal happens under the buffer lock so a concurrent submit or
    // shutdown sees either the whole group or none of it.
    let (armed, group, turn) = {
        let mut state = shared.lock();
        if state.closed {
            return;
        }
        match state.groups.get(&key) {
            Some(pending) if pending.generation == generation => {}
            _ => return,
        }
        let Some(armed) = state.armed.clone() else {
            return;
        };
        let Some(pending) = state.groups.remove(&key) else {
            return;
        };
        let turn = Arc::clone(state.turns.entry(key.clone()).or_default());
        state.in_flight += 1;

        let group = Group {
            key: Some(key.clone()),
            entries: pending.items,
        };
        (armed, group, turn)
    };

    {
        let _turn = turn.lock().await;
        run_consumer(&armed, group).await;
    }

    let mut state = shared.lock();
    let idle = state
        .turns
        .get(&key)
        .is_some_and(|t| Arc::ptr_eq(t, &turn) && Arc::strong_count(t) == 2);
    if idle {
        state.turns.remove(&key);
    }
    shared.finish_delivery(&mut state);
}

async fn run_consumer<T: Send + 'static>(armed: &Armed<T>, group: Group<T>) {
    let key = group.key.clone();
    info!(
        "Flushing group {} ({} item(s))",
        key.as_deref().unwrap_or("<none>"),
        group.len()
    );

    let outcome = AssertUnwindSafe(armed.handler.on_flush(group))
        .catch_unwind()
        .await;

    let failure = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(RelayError::Consumer(msg))) => RelayError::Consumer(msg),
        Ok(Err(e)) => RelayError::Consumer(e.to_string()),
        Err(panic) => RelayError::Consumer(panic_message(panic.as_ref())),
    };
    // A sink that panics must not skip the in-flight bookkeeping.
    let reported = std::panic::catch_unwind(AssertUnwindSafe(|| {
        armed.sink.report(key.as_deref(), &failure)
    }));
    if reported.is_err() {
        error!(
            "Error sink panicked while reporting group {}: {failure}",
            key.as_deref().unwrap_or("<none>")
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("consumer panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("consumer panicked: {s}")
    } else {
        "consumer panicked".to_string()
    }
}
