//! Typed in-process publish/subscribe

use dashmap::DashMap;
use futures::future::join_all;
use futures::FutureExt;
use std::any::{Any, TypeId};
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::module::panic_message;

/// Error a handler may return
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;
type ErasedHandler =
    Arc<dyn Fn(Arc<dyn Any + Send + Sync>, CancellationToken) -> HandlerFuture + Send + Sync>;
type HandlerMap = DashMap<TypeId, Arc<Vec<HandlerEntry>>>;

#[derive(Clone)]
struct HandlerEntry {
    id: u64,
    handler: ErasedHandler,
}

/// Outcome of one publish
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Handlers invoked
    pub invoked: usize,
    /// Handlers that returned an error or panicked
    pub failed: usize,
}

impl PublishReport {
    /// Handlers that completed successfully
    pub fn succeeded(&self) -> usize {
        self.invoked - self.failed
    }
}

/// The publisher stopped waiting for handlers
#[derive(Debug, Clone, thiserror::Error)]
#[error("publishing {event_type} was cancelled")]
pub struct PublishCancelled {
    /// Type name of the event
    pub event_type: &'static str,
}

/// Process-wide typed event bus
///
/// Handlers are keyed by the exact event type; there is no dispatch to
/// supertypes. Every publish works on a snapshot of the handler list, so
/// subscribing or disposing during a publish never affects it. Clones share
/// the same handler table.
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<HandlerMap>,
    next_id: Arc<AtomicU64>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers: usize = self.handlers.iter().map(|e| e.value().len()).sum();
        f.debug_struct("EventBus")
            .field("event_types", &self.handlers.len())
            .field("handlers", &handlers)
            .finish()
    }
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for events of type `E`
    ///
    /// The handler stays registered until [`Subscription::dispose`] is
    /// called; dropping the subscription does not remove it.
    pub fn subscribe<E, F, Fut>(&self, handler: F) -> Subscription
    where
        E: Send + Sync + 'static,
        F: Fn(Arc<E>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let type_id = TypeId::of::<E>();
        let event_type = std::any::type_name::<E>();

        let erased: ErasedHandler = Arc::new(
            move |event: Arc<dyn Any + Send + Sync>, cancel: CancellationToken| -> HandlerFuture {
                match event.downcast::<E>() {
                    Ok(event) => Box::pin(handler(event, cancel)),
                    Err(_) => Box::pin(futures::future::ready(Err(HandlerError::from(format!(
                        "event is not a {event_type}"
                    ))))),
                }
            },
        );

        let mut slot = self.handlers.entry(type_id).or_default();
        let mut next = Vec::with_capacity(slot.len() + 1);
        next.extend(slot.iter().cloned());
        next.push(HandlerEntry { id, handler: erased });
        *slot = Arc::new(next);
        drop(slot);

        debug!(event_type, handler = id, "Handler subscribed");
        Subscription {
            id,
            type_id,
            event_type,
            handlers: Arc::downgrade(&self.handlers),
        }
    }

    /// Deliver `event` to every current subscriber and wait for all of them
    ///
    /// Handler errors and panics are logged and counted, never propagated.
    pub async fn publish<E>(&self, event: E) -> PublishReport
    where
        E: Send + Sync + 'static,
    {
        let cancel = CancellationToken::new();
        self.dispatch(Arc::new(event), &cancel).await
    }

    /// Like [`EventBus::publish`], but stop waiting once `cancel` fires
    ///
    /// Handlers receive a child of `cancel`. Handlers still running when it
    /// fires are abandoned.
    pub async fn publish_with_cancel<E>(
        &self,
        event: E,
        cancel: &CancellationToken,
    ) -> Result<PublishReport, PublishCancelled>
    where
        E: Send + Sync + 'static,
    {
        let event_type = std::any::type_name::<E>();
        if cancel.is_cancelled() {
            return Err(PublishCancelled { event_type });
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(event_type, "Publish cancelled");
                Err(PublishCancelled { event_type })
            }
            report = self.dispatch(Arc::new(event), cancel) => Ok(report),
        }
    }

    async fn dispatch<E>(&self, event: Arc<E>, cancel: &CancellationToken) -> PublishReport
    where
        E: Send + Sync + 'static,
    {
        let event_type = std::any::type_name::<E>();
        let Some(snapshot) = self.snapshot(TypeId::of::<E>()) else {
            trace!(event_type, "No subscribers");
            return PublishReport::default();
        };

        let event: Arc<dyn Any + Send + Sync> = event;
        let invocations = snapshot.iter().map(|entry| {
            let started = catch_unwind(AssertUnwindSafe(|| {
                (entry.handler)(Arc::clone(&event), cancel.child_token())
            }));
            let id = entry.id;
            async move {
                let outcome = match started {
                    Ok(future) => match AssertUnwindSafe(future).catch_unwind().await {
                        Ok(result) => result,
                        Err(payload) => Err(HandlerError::from(format!(
                            "handler panicked: {}",
                            panic_message(payload.as_ref())
                        ))),
                    },
                    Err(payload) => Err(HandlerError::from(format!(
                        "handler panicked: {}",
                        panic_message(payload.as_ref())
                    ))),
                };
                if let Err(e) = &outcome {
                    error!(event_type, handler = id, error = %e, "Event handler failed");
                }
                outcome.is_ok()
            }
        });

        let outcomes = join_all(invocations).await;
        let report = PublishReport {
            invoked: outcomes.len(),
            failed: outcomes.iter().filter(|ok| !**ok).count(),
        };
        trace!(
            event_type,
            invoked = report.invoked,
            failed = report.failed,
            "Event published"
        );
        report
    }

    fn snapshot(&self, type_id: TypeId) -> Option<Arc<Vec<HandlerEntry>>> {
        self.handlers
            .get(&type_id)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|list| !list.is_empty())
    }

    /// Number of handlers registered for `E`
    pub fn handler_count<E: 'static>(&self) -> usize {
        self.handlers
            .get(&TypeId::of::<E>())
            .map(|entry| entry.value().len())
            .unwrap_or(0)
    }

    /// Whether any handler is registered for `E`
    pub fn has_subscribers<E: 'static>(&self) -> bool {
        self.handler_count::<E>() > 0
    }
}

/// One handler registration
///
/// Consumed by [`Subscription::dispose`]. Dropping it leaves the handler
/// registered for the lifetime of the bus.
#[must_use = "dropping a Subscription keeps the handler registered; call dispose to remove it"]
pub struct Subscription {
    id: u64,
    type_id: TypeId,
    event_type: &'static str,
    handlers: Weak<HandlerMap>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("event_type", &self.event_type)
            .finish()
    }
}

impl Subscription {
    /// Handler id, unique per bus
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Type name of the subscribed event
    pub fn event_type(&self) -> &'static str {
        self.event_type
    }

    /// Remove exactly this handler
    ///
    /// Publishes already in flight may still invoke it. Returns `false` if
    /// the bus is gone or the handler was not found.
    pub fn dispose(self) -> bool {
        let Some(handlers) = self.handlers.upgrade() else {
            return false;
        };

        let removed = match handlers.get_mut(&self.type_id) {
            Some(mut slot) => {
                let before = slot.len();
                let next: Vec<HandlerEntry> =
                    slot.iter().filter(|h| h.id != self.id).cloned().collect();
                let removed = next.len() != before;
                *slot = Arc::new(next);
                removed
            }
            None => false,
        };
        handlers.remove_if(&self.type_id, |_, list| list.is_empty());

        if removed {
            debug!(event_type = self.event_type, handler = self.id, "Handler disposed");
        }
        removed
    }
}
