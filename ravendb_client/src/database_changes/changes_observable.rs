use std::{marker::PhantomData, sync::Arc};

use tokio::sync::mpsc;

use super::{
    changes_notifications::{ChangeNotification, ChangesType, Notification},
    database_connection_state::{ConnectionRegistry, DatabaseConnectionState, WatchCommand},
    DatabaseChangesError, DatabaseChangesMessage,
};

/// Receives the notifications of a [`ChangesObservable`].
///
/// Implemented for any `Fn(&T)` closure, which ignores errors.
pub trait ChangesObserver<T>: Send + Sync {
    fn on_next(&self, value: &T);

    fn on_error(&self, _error: &DatabaseChangesError) {}
}

impl<T, F> ChangesObserver<T> for F
where
    F: Fn(&T) + Send + Sync,
{
    fn on_next(&self, value: &T) {
        self(value)
    }
}

/// A filtered view over one subscription key of a changes connection.
///
/// Nothing is watched on the server until the first [`subscribe`](Self::subscribe).
pub struct ChangesObservable<T> {
    key: String,
    watch_command: WatchCommand,
    filter: Arc<dyn Fn(&T) -> bool + Send + Sync>,
    registry: Arc<ConnectionRegistry>,
    sender: mpsc::UnboundedSender<DatabaseChangesMessage>,
    _marker: PhantomData<fn(&T)>,
}

impl<T> std::fmt::Debug for ChangesObservable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangesObservable")
            .field("key", &self.key)
            .field("watch_command", &self.watch_command)
            .finish()
    }
}

impl<T: ChangeNotification> ChangesObservable<T> {
    pub(crate) fn new(
        key: String,
        watch_command: WatchCommand,
        filter: impl Fn(&T) -> bool + Send + Sync + 'static,
        registry: Arc<ConnectionRegistry>,
        sender: mpsc::UnboundedSender<DatabaseChangesMessage>,
    ) -> Self {
        Self {
            key,
            watch_command,
            filter: Arc::new(filter),
            registry,
            sender,
            _marker: PhantomData,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Registers `observer` and returns the handle that keeps it registered.
    ///
    /// Only notifications passing this observable's filter reach `observer`.
    pub fn subscribe<O>(&self, observer: O) -> ChangesSubscription
    where
        O: ChangesObserver<T> + 'static,
    {
        let observer = Arc::new(observer);
        let state = self
            .registry
            .acquire(&self.key, &self.watch_command, &self.sender);

        let filter = self.filter.clone();
        let on_next = observer.clone();
        let change_id = state.add_on_change_notification(
            T::CHANGES_TYPE,
            Arc::new(move |notification: &Notification| {
                if let Some(change) = T::from_notification(notification) {
                    if filter(change) {
                        on_next.on_next(change);
                    }
                }
            }),
        );
        let error_id = state.add_on_error(Arc::new(move |error: &DatabaseChangesError| {
            observer.on_error(error)
        }));

        ChangesSubscription {
            inner: Some(SubscriptionInner {
                key: self.key.clone(),
                state,
                change_id,
                error_id,
                changes_type: T::CHANGES_TYPE,
                registry: self.registry.clone(),
                sender: self.sender.clone(),
            }),
        }
    }
}

struct SubscriptionInner {
    key: String,
    state: Arc<DatabaseConnectionState>,
    change_id: u64,
    error_id: u64,
    changes_type: ChangesType,
    registry: Arc<ConnectionRegistry>,
    sender: mpsc::UnboundedSender<DatabaseChangesMessage>,
}

/// Keeps an observer registered. Dropping it unsubscribes.
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct ChangesSubscription {
    inner: Option<SubscriptionInner>,
}

impl std::fmt::Debug for ChangesSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangesSubscription")
            .field("key", &self.inner.as_ref().map(|inner| inner.key.as_str()))
            .finish()
    }
}

impl ChangesSubscription {
    pub fn close(mut self) {
        self.dispose();
    }

    fn dispose(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner
                .state
                .remove_on_change_notification(inner.changes_type, inner.change_id);
            inner.state.remove_on_error(inner.error_id);
            inner.registry.release(&inner.key, &inner.state, &inner.sender);
        }
    }
}

impl Drop for ChangesSubscription {
    fn drop(&mut self) {
        self.dispose();
    }
}
