//! Push notifications about a single database, delivered over one websocket.
mod changes_connection;
mod changes_notifications;
mod changes_observable;
mod database_changes_actor;
mod database_changes_error;
mod database_changes_handle;
mod database_connection_state;

pub use changes_connection::{ChangesConnection, ChangesConnector, WebSocketConnector};
pub use changes_notifications::{
    ChangeNotification, ChangesType, DocumentChange, DocumentChangeType, IndexChange,
    IndexChangeType, Notification, OperationStatusChange,
};
pub use changes_observable::{ChangesObservable, ChangesObserver, ChangesSubscription};
pub use database_changes_actor::DatabaseChangesActor;
pub use database_changes_error::DatabaseChangesError;
pub use database_changes_handle::DatabaseChanges;
pub use database_connection_state::DatabaseConnectionState;

#[cfg(test)]
pub(crate) use changes_connection::in_memory;

use tokio::sync::oneshot;

use database_connection_state::WatchCommand;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Faulted(String),
    Closed,
}

#[derive(Debug)]
pub(crate) enum DatabaseChangesMessage {
    Watch {
        key: String,
    },
    Unwatch {
        key: String,
        command: WatchCommand,
    },
    Close {
        respond_to: oneshot::Sender<()>,
    },
}
