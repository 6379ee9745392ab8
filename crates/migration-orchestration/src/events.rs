//! Migration lifecycle events
//!
//! Listeners are registered explicitly and stay attached until they are
//! unregistered. Publishing is synchronous: every listener sees the event
//! before [`EventPublisher::publish`] returns, so listeners must not block.

use migration_state::{MigrationId, MigrationStage};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Something that happened to a migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MigrationEvent {
    /// A migration record was created
    Created {
        /// Created migration
        migration_id: MigrationId,
    },
    /// A migration moved to a new stage
    Transitioned {
        /// Migration that moved
        migration_id: MigrationId,
        /// Stage before
        from: MigrationStage,
        /// Stage after
        to: MigrationStage,
    },
    /// A transition was rejected by the stage table
    TransitionFailed {
        /// Migration that stayed put
        migration_id: MigrationId,
        /// Current stage
        from: MigrationStage,
        /// Requested stage
        to: MigrationStage,
    },
    /// A migration was moved to the error stage
    Failed {
        /// Failed migration
        migration_id: MigrationId,
        /// Stage the failure happened in
        failed_stage: MigrationStage,
        /// Truncated failure reason
        reason: String,
        /// Seconds since the migration started
        elapsed_secs: i64,
    },
    /// A migration finished
    Completed {
        /// Finished migration
        migration_id: MigrationId,
        /// Seconds since the migration started
        elapsed_secs: i64,
    },
    /// A migration was deleted by a reset
    Reset {
        /// Deleted migration
        migration_id: MigrationId,
    },
}

impl MigrationEvent {
    /// The migration the event is about
    pub fn migration_id(&self) -> MigrationId {
        match self {
            Self::Created { migration_id }
            | Self::Transitioned { migration_id, .. }
            | Self::TransitionFailed { migration_id, .. }
            | Self::Failed { migration_id, .. }
            | Self::Completed { migration_id, .. }
            | Self::Reset { migration_id } => *migration_id,
        }
    }
}

/// Receives published migration events
pub trait MigrationEventListener: Send + Sync {
    /// Handle one event
    fn on_event(&self, event: &MigrationEvent);
}

/// Registration token returned by [`EventPublisher::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Fan-out of migration events to registered listeners
pub struct EventPublisher {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn MigrationEventListener>)>>,
    next_id: AtomicU64,
}

impl EventPublisher {
    /// Create a publisher with no listeners
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Attach a listener
    pub fn register(&self, listener: Arc<dyn MigrationEventListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        debug!("Registered migration event listener {:?}", id);
        id
    }

    /// Detach a listener, returning whether it was attached
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(registered, _)| *registered != id);
        let removed = listeners.len() != before;
        if removed {
            debug!("Unregistered migration event listener {:?}", id);
        }
        removed
    }

    /// Number of attached listeners
    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver `event` to every attached listener, in registration order
    pub fn publish(&self, event: MigrationEvent) {
        // Snapshot so listeners may register or unregister while handling
        let listeners: Vec<_> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        debug!("Publishing {:?} to {} listener(s)", event, listeners.len());
        for listener in listeners {
            listener.on_event(&event);
        }
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<MigrationEvent>>);

    impl MigrationEventListener for Recorder {
        fn on_event(&self, event: &MigrationEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_publish_reaches_registered_listeners_only() {
        let publisher = EventPublisher::new();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());

        let first_id = publisher.register(first.clone());
        publisher.register(second.clone());

        publisher.publish(MigrationEvent::Created {
            migration_id: MigrationId(1),
        });
        assert!(publisher.unregister(first_id));
        assert!(!publisher.unregister(first_id));
        publisher.publish(MigrationEvent::Reset {
            migration_id: MigrationId(1),
        });

        assert_eq!(first.0.lock().unwrap().len(), 1);
        assert_eq!(second.0.lock().unwrap().len(), 2);
        assert_eq!(publisher.listener_count(), 1);
    }

    #[test]
    fn test_listener_may_unregister_itself() {
        struct OneShot {
            publisher: Arc<EventPublisher>,
            id: Mutex<Option<ListenerId>>,
            seen: Mutex<usize>,
        }

        impl MigrationEventListener for OneShot {
            fn on_event(&self, _event: &MigrationEvent) {
                *self.seen.lock().unwrap() += 1;
                if let Some(id) = self.id.lock().unwrap().take() {
                    self.publisher.unregister(id);
                }
            }
        }

        let publisher = Arc::new(EventPublisher::new());
        let listener = Arc::new(OneShot {
            publisher: publisher.clone(),
            id: Mutex::new(None),
            seen: Mutex::new(0),
        });
        let id = publisher.register(listener.clone());
        *listener.id.lock().unwrap() = Some(id);

        for _ in 0..3 {
            publisher.publish(MigrationEvent::Reset {
                migration_id: MigrationId(9),
            });
        }
        assert_eq!(*listener.seen.lock().unwrap(), 1);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = MigrationEvent::Transitioned {
            migration_id: MigrationId(4),
            from: MigrationStage::NotStarted,
            to: MigrationStage::Authentication,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "transitioned");
        assert_eq!(json["from"], "not_started");
        assert_eq!(event.migration_id(), MigrationId(4));
    }
}
