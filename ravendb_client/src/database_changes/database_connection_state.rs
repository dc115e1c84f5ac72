use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    changes_notifications::{ChangesType, Notification},
    DatabaseChangesError, DatabaseChangesMessage,
};

pub(crate) type NotificationHandler = Arc<dyn Fn(&Notification) + Send + Sync>;
pub(crate) type ErrorHandler = Arc<dyn Fn(&DatabaseChangesError) + Send + Sync>;

/// The commands that start and stop the server side feed behind one subscription key.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct WatchCommand {
    pub watch: &'static str,
    pub unwatch: &'static str,
    pub param: Option<String>,
}

#[derive(Default)]
struct Handlers {
    next_id: u64,
    on_change: HashMap<ChangesType, Vec<(u64, NotificationHandler)>>,
    on_error: Vec<(u64, ErrorHandler)>,
}

/// Shared state of every subscriber to one key, like `docs/users/1` or `all-indexes`.
///
/// The reference count is only modified under the [`ConnectionRegistry`] lock.
pub struct DatabaseConnectionState {
    watch_command: WatchCommand,
    reference_count: Mutex<usize>,
    handlers: Mutex<Handlers>,
}

impl std::fmt::Debug for DatabaseConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConnectionState")
            .field("watch_command", &self.watch_command)
            .field("reference_count", &*self.reference_count.lock())
            .finish()
    }
}

impl DatabaseConnectionState {
    pub(crate) fn new(watch_command: WatchCommand) -> Self {
        Self {
            watch_command,
            reference_count: Mutex::new(0),
            handlers: Mutex::new(Handlers::default()),
        }
    }

    pub fn reference_count(&self) -> usize {
        *self.reference_count.lock()
    }

    pub(crate) fn watch_command(&self) -> &WatchCommand {
        &self.watch_command
    }

    pub(crate) fn add_on_change_notification(
        &self,
        changes_type: ChangesType,
        handler: NotificationHandler,
    ) -> u64 {
        let mut handlers = self.handlers.lock();
        handlers.next_id += 1;
        let id = handlers.next_id;
        handlers
            .on_change
            .entry(changes_type)
            .or_default()
            .push((id, handler));
        id
    }

    pub(crate) fn remove_on_change_notification(&self, changes_type: ChangesType, id: u64) {
        let mut handlers = self.handlers.lock();
        if let Some(list) = handlers.on_change.get_mut(&changes_type) {
            list.retain(|(handler_id, _)| *handler_id != id);
        }
    }

    pub(crate) fn add_on_error(&self, handler: ErrorHandler) -> u64 {
        let mut handlers = self.handlers.lock();
        handlers.next_id += 1;
        let id = handlers.next_id;
        handlers.on_error.push((id, handler));
        id
    }

    pub(crate) fn remove_on_error(&self, id: u64) {
        self.handlers
            .lock()
            .on_error
            .retain(|(handler_id, _)| *handler_id != id);
    }

    /// Delivers a notification to every handler registered for its type.
    ///
    /// Handlers run outside the lock, on a snapshot, so they may subscribe or dispose freely.
    /// A panicking handler is logged and does not stop delivery to the others.
    pub(crate) fn send(&self, notification: &Notification) {
        let snapshot: Vec<NotificationHandler> = match self
            .handlers
            .lock()
            .on_change
            .get(&notification.changes_type())
        {
            Some(list) => list.iter().map(|(_, handler)| handler.clone()).collect(),
            None => return,
        };

        for handler in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(notification))).is_err() {
                tracing::error!(
                    command = self.watch_command.watch,
                    "A changes observer panicked while handling a notification"
                );
            }
        }
    }

    pub(crate) fn error(&self, error: &DatabaseChangesError) {
        let snapshot: Vec<ErrorHandler> = self
            .handlers
            .lock()
            .on_error
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(error))).is_err() {
                tracing::error!(
                    command = self.watch_command.watch,
                    "A changes observer panicked while handling an error"
                );
            }
        }
    }
}

/// Every live subscription key of one changes connection.
#[derive(Debug, Default)]
pub(crate) struct ConnectionRegistry {
    states: Mutex<HashMap<String, Arc<DatabaseConnectionState>>>,
}

impl ConnectionRegistry {
    /// Takes a reference on the state of `key`, creating it if needed.
    ///
    /// The first reference queues the watch command.
    pub(crate) fn acquire(
        &self,
        key: &str,
        watch_command: &WatchCommand,
        sender: &mpsc::UnboundedSender<DatabaseChangesMessage>,
    ) -> Arc<DatabaseConnectionState> {
        let mut states = self.states.lock();
        let state = states
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(DatabaseConnectionState::new(watch_command.clone())))
            .clone();

        let mut count = state.reference_count.lock();
        *count += 1;
        if *count == 1 {
            tracing::debug!(key, "First subscriber, watching");
            // The actor may be gone already, the registry is still consistent without it.
            let _ = sender.send(DatabaseChangesMessage::Watch {
                key: key.to_string(),
            });
        }
        drop(count);

        state
    }

    /// Gives back a reference taken by [`acquire`](Self::acquire).
    ///
    /// The last reference removes the state and queues the unwatch command.
    pub(crate) fn release(
        &self,
        key: &str,
        state: &Arc<DatabaseConnectionState>,
        sender: &mpsc::UnboundedSender<DatabaseChangesMessage>,
    ) {
        let mut states = self.states.lock();
        let mut count = state.reference_count.lock();
        if *count == 0 {
            return;
        }
        *count -= 1;
        if *count > 0 {
            return;
        }
        drop(count);

        if states
            .get(key)
            .map(|current| Arc::ptr_eq(current, state))
            .unwrap_or(false)
        {
            states.remove(key);
        }
        tracing::debug!(key, "Last subscriber gone, unwatching");
        let _ = sender.send(DatabaseChangesMessage::Unwatch {
            key: key.to_string(),
            command: state.watch_command.clone(),
        });
    }

    pub(crate) fn get(&self, key: &str) -> Option<Arc<DatabaseConnectionState>> {
        self.states.lock().get(key).cloned()
    }

    pub(crate) fn snapshot(&self) -> Vec<(String, Arc<DatabaseConnectionState>)> {
        self.states
            .lock()
            .iter()
            .map(|(key, state)| (key.clone(), state.clone()))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.states.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::database_changes::changes_notifications::DocumentChange;

    use super::*;

    fn all_docs() -> WatchCommand {
        WatchCommand {
            watch: "watch-docs",
            unwatch: "unwatch-docs",
            param: None,
        }
    }

    fn document_notification() -> Notification {
        Notification::Document(DocumentChange {
            id: "users/1".to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn only_first_acquire_and_last_release_reach_the_actor() {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let registry = ConnectionRegistry::default();

        let states: Vec<_> = (0..3)
            .map(|_| registry.acquire("all-docs", &all_docs(), &sender))
            .collect();
        assert_eq!(states[0].reference_count(), 3);
        assert!(states.iter().all(|state| Arc::ptr_eq(state, &states[0])));

        for state in &states {
            registry.release("all-docs", state, &sender);
        }

        assert!(matches!(
            receiver.try_recv(),
            Ok(DatabaseChangesMessage::Watch { key }) if key == "all-docs"
        ));
        assert!(matches!(
            receiver.try_recv(),
            Ok(DatabaseChangesMessage::Unwatch { key, .. }) if key == "all-docs"
        ));
        assert!(receiver.try_recv().is_err());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn extra_release_is_ignored() {
        let (sender, _receiver) = mpsc::unbounded_channel();
        let registry = ConnectionRegistry::default();
        let state = registry.acquire("all-docs", &all_docs(), &sender);
        registry.release("all-docs", &state, &sender);

        let fresh = registry.acquire("all-docs", &all_docs(), &sender);
        registry.release("all-docs", &state, &sender);

        assert_eq!(fresh.reference_count(), 1);
        assert!(registry.get("all-docs").is_some());
    }

    #[test]
    fn panicking_handler_does_not_stop_delivery() {
        let state = DatabaseConnectionState::new(all_docs());
        let delivered = Arc::new(AtomicUsize::new(0));
        state.add_on_change_notification(
            ChangesType::Document,
            Arc::new(|_: &Notification| panic!("observer failure")),
        );
        let counter = delivered.clone();
        state.add_on_change_notification(
            ChangesType::Document,
            Arc::new(move |_: &Notification| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        state.send(&document_notification());
        state.send(&document_notification());

        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn removed_handlers_are_not_called() {
        let state = DatabaseConnectionState::new(all_docs());
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = delivered.clone();
        let id = state.add_on_change_notification(
            ChangesType::Document,
            Arc::new(move |_: &Notification| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        state.send(&document_notification());
        state.remove_on_change_notification(ChangesType::Document, id);
        state.send(&document_notification());

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_may_unsubscribe_itself_while_being_called() {
        let state = Arc::new(DatabaseConnectionState::new(all_docs()));
        let id = Arc::new(AtomicUsize::new(0));
        let (weak_state, handler_id) = (Arc::downgrade(&state), id.clone());
        let registered = state.add_on_change_notification(
            ChangesType::Document,
            Arc::new(move |_: &Notification| {
                if let Some(state) = weak_state.upgrade() {
                    state.remove_on_change_notification(
                        ChangesType::Document,
                        handler_id.load(Ordering::SeqCst) as u64,
                    );
                }
            }),
        );
        id.store(registered as usize, Ordering::SeqCst);

        state.send(&document_notification());

        assert!(state.handlers.lock().on_change[&ChangesType::Document].is_empty());
    }
}
