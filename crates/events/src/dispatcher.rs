//! Type-indexed publish/subscribe dispatcher.
//!
//! ## Delivery model
//!
//! - Handlers are registered per event type (`on`, `once`) or as wildcards
//!   (`on_any`). On emit, type-specific handlers run first, wildcards after.
//! - `emit` runs every matching handler inline and sequentially before
//!   returning the envelope.
//! - `emit_detached` runs the same handler set on a background thread. The
//!   emitter does not wait for completion, but handler failures still reach
//!   the error callback; they are never silently dropped.
//! - A handler failure is routed to the configured error callback and never
//!   prevents the remaining handlers from running, nor the emit call from
//!   returning.
//!
//! ## Once semantics
//!
//! A `once` registration is removed from the registry under the lock, before
//! any handler runs. Two concurrent emits of the same type therefore cannot
//! both observe it; it fires exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::event::EventKind;

/// Default timeout for [`EventDispatcher::wait_for`].
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

type Handler<E> = Arc<dyn Fn(&Envelope<E>) -> anyhow::Result<()> + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&'static str, &anyhow::Error) + Send + Sync>;

/// Opaque registration handle, usable with [`EventDispatcher::off`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Error from [`EventDispatcher::wait_for`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WaitError {
    #[error("no matching event within {waited:?}")]
    Timeout { waited: Duration },
    #[error("dispatcher dropped while waiting")]
    Closed,
}

struct Registration<E> {
    id: HandlerId,
    once: bool,
    handler: Handler<E>,
}

/// Typed publish/subscribe dispatcher.
pub struct EventDispatcher<E> {
    livemode: bool,
    next_id: AtomicU64,
    by_type: Mutex<HashMap<&'static str, Vec<Registration<E>>>>,
    any: Mutex<Vec<Registration<E>>>,
    on_error: ErrorCallback,
}

impl<E> EventDispatcher<E>
where
    E: EventKind,
{
    pub fn new(livemode: bool) -> Self {
        Self {
            livemode,
            next_id: AtomicU64::new(1),
            by_type: Mutex::new(HashMap::new()),
            any: Mutex::new(Vec::new()),
            on_error: Arc::new(|event_type, error| {
                tracing::error!(event_type, error = %error, "event handler failed");
            }),
        }
    }

    /// Replace the default (log-only) error callback.
    pub fn with_error_callback(
        mut self,
        callback: impl Fn(&'static str, &anyhow::Error) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Arc::new(callback);
        self
    }

    pub fn livemode(&self) -> bool {
        self.livemode
    }

    /// Register a durable handler for one event type.
    pub fn on(
        &self,
        event_type: &'static str,
        handler: impl Fn(&Envelope<E>) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> HandlerId {
        self.register(event_type, false, handler)
    }

    /// Register a handler removed after its first invocation.
    pub fn once(
        &self,
        event_type: &'static str,
        handler: impl Fn(&Envelope<E>) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> HandlerId {
        self.register(event_type, true, handler)
    }

    /// Register a wildcard handler, invoked for every event type after the
    /// type-specific handlers.
    pub fn on_any(
        &self,
        handler: impl Fn(&Envelope<E>) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> HandlerId {
        let id = self.allocate_id();
        let mut any = self.any.lock().unwrap_or_else(|e| e.into_inner());
        any.push(Registration {
            id,
            once: false,
            handler: Arc::new(handler),
        });
        id
    }

    /// Deregister a handler. Returns false if it was already gone.
    pub fn off(&self, id: HandlerId) -> bool {
        {
            let mut by_type = self.by_type.lock().unwrap_or_else(|e| e.into_inner());
            for registrations in by_type.values_mut() {
                let before = registrations.len();
                registrations.retain(|r| r.id != id);
                if registrations.len() < before {
                    return true;
                }
            }
        }
        let mut any = self.any.lock().unwrap_or_else(|e| e.into_inner());
        let before = any.len();
        any.retain(|r| r.id != id);
        any.len() < before
    }

    /// Number of handlers currently registered for one event type.
    pub fn handler_count(&self, event_type: &str) -> usize {
        let by_type = self.by_type.lock().unwrap_or_else(|e| e.into_inner());
        by_type.get(event_type).map_or(0, Vec::len)
    }

    /// Construct the envelope and run all matching handlers inline.
    ///
    /// Handler errors go to the error callback; the envelope is always
    /// returned.
    pub fn emit(&self, payload: E) -> Envelope<E> {
        let event_type = payload.event_type();
        let envelope = self.envelope(payload);
        let handlers = self.collect(event_type);
        self.run(event_type, &envelope, &handlers);
        envelope
    }

    /// Construct the envelope, then run the matching handlers on a background
    /// thread without waiting for them. Failures still reach the error
    /// callback.
    pub fn emit_detached(&self, payload: E) -> Envelope<E> {
        let event_type = payload.event_type();
        let envelope = self.envelope(payload);
        let handlers = self.collect(event_type);

        let detached = envelope.clone();
        let on_error = Arc::clone(&self.on_error);
        std::thread::Builder::new()
            .name("event-dispatch".to_string())
            .spawn(move || {
                for handler in &handlers {
                    if let Err(error) = handler(&detached) {
                        on_error(event_type, &error);
                    }
                }
            })
            .expect("failed to spawn event dispatch thread");

        envelope
    }

    /// Block until the next event of the given type, up to
    /// [`DEFAULT_WAIT_TIMEOUT`].
    pub fn wait_for(&self, event_type: &'static str) -> Result<Envelope<E>, WaitError> {
        self.wait_for_within(event_type, DEFAULT_WAIT_TIMEOUT)
    }

    /// Block until the next event of the given type or the timeout elapses.
    ///
    /// The temporary listener is deregistered on timeout, so an abandoned
    /// wait leaves nothing behind.
    pub fn wait_for_within(
        &self,
        event_type: &'static str,
        timeout: Duration,
    ) -> Result<Envelope<E>, WaitError> {
        let (tx, rx) = mpsc::channel::<Envelope<E>>();
        let id = self.once(event_type, move |envelope| {
            let _ = tx.send(envelope.clone());
            Ok(())
        });

        match rx.recv_timeout(timeout) {
            Ok(envelope) => Ok(envelope),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                self.off(id);
                Err(WaitError::Timeout { waited: timeout })
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                self.off(id);
                Err(WaitError::Closed)
            }
        }
    }

    fn allocate_id(&self) -> HandlerId {
        HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn register(
        &self,
        event_type: &'static str,
        once: bool,
        handler: impl Fn(&Envelope<E>) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> HandlerId {
        let id = self.allocate_id();
        let mut by_type = self.by_type.lock().unwrap_or_else(|e| e.into_inner());
        by_type.entry(event_type).or_default().push(Registration {
            id,
            once,
            handler: Arc::new(handler),
        });
        id
    }

    fn envelope(&self, payload: E) -> Envelope<E> {
        Envelope::new(Uuid::now_v7(), self.livemode, Utc::now(), payload)
    }

    /// Snapshot the handlers for one dispatch: type-specific first, wildcards
    /// after. Once-registrations are removed here, under the lock.
    fn collect(&self, event_type: &str) -> Vec<Handler<E>> {
        let mut handlers = Vec::new();
        {
            let mut by_type = self.by_type.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(registrations) = by_type.get_mut(event_type) {
                for r in registrations.iter() {
                    handlers.push(Arc::clone(&r.handler));
                }
                registrations.retain(|r| !r.once);
            }
        }
        {
            let any = self.any.lock().unwrap_or_else(|e| e.into_inner());
            for r in any.iter() {
                handlers.push(Arc::clone(&r.handler));
            }
        }
        handlers
    }

    fn run(&self, event_type: &'static str, envelope: &Envelope<E>, handlers: &[Handler<E>]) {
        for handler in handlers {
            if let Err(error) = handler(envelope) {
                (self.on_error)(event_type, &error);
            }
        }
    }
}

impl<E> core::fmt::Debug for EventDispatcher<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("livemode", &self.livemode)
            .finish_non_exhaustive()
    }
}
