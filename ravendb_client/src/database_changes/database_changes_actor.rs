use std::{collections::HashSet, sync::Arc, time::Duration};

use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::instrument;

use crate::request_executor::RequestExecutor;

use super::{
    changes_connection::{changes_url, ChangesConnection, ChangesConnector},
    changes_notifications::{decode_frame, IncomingMessage},
    database_connection_state::{ConnectionRegistry, WatchCommand},
    ConnectionStatus, DatabaseChangesError, DatabaseChangesMessage,
};

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CommandFrame<'a> {
    command_id: u64,
    command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    param: Option<&'a str>,
}

enum Disconnect {
    Closed(Option<oneshot::Sender<()>>),
    Lost(DatabaseChangesError),
}

/// Owns the changes connection: connects, replays watches, dispatches frames and reconnects.
pub struct DatabaseChangesActor {
    command_id: u64,
    connector: Arc<dyn ChangesConnector>,
    database: String,
    receiver: mpsc::UnboundedReceiver<DatabaseChangesMessage>,
    reconnect_delay: Duration,
    registry: Arc<ConnectionRegistry>,
    request_executor: RequestExecutor,
    status: watch::Sender<ConnectionStatus>,
    watched: HashSet<String>,
}

impl DatabaseChangesActor {
    pub(crate) fn new(
        receiver: mpsc::UnboundedReceiver<DatabaseChangesMessage>,
        connector: Arc<dyn ChangesConnector>,
        database: String,
        reconnect_delay: Duration,
        registry: Arc<ConnectionRegistry>,
        request_executor: RequestExecutor,
        status: watch::Sender<ConnectionStatus>,
    ) -> Self {
        Self {
            command_id: 0,
            connector,
            database,
            receiver,
            reconnect_delay,
            registry,
            request_executor,
            status,
            watched: HashSet::new(),
        }
    }

    /// Opens a connection to the preferred node while still answering `Close`.
    async fn connect(&mut self) -> Result<Box<dyn ChangesConnection>, Disconnect> {
        let opening = open_connection(
            &self.request_executor,
            self.connector.as_ref(),
            &self.database,
        );
        tokio::pin!(opening);

        loop {
            tokio::select! {
                result = &mut opening => return result.map_err(Disconnect::Lost),
                opt_msg = self.receiver.recv() => match opt_msg {
                    None => return Err(Disconnect::Closed(None)),
                    Some(DatabaseChangesMessage::Close { respond_to }) => {
                        return Err(Disconnect::Closed(Some(respond_to)))
                    }
                    // Replayed from the registry once connected.
                    Some(_) => {}
                },
            }
        }
    }

    /// Watches every key that has subscribers, the server forgets them with the connection.
    async fn on_connected(
        &mut self,
        connection: &mut Box<dyn ChangesConnection>,
    ) -> Result<(), DatabaseChangesError> {
        self.watched.clear();
        for (key, state) in self.registry.snapshot() {
            let command = state.watch_command().clone();
            self.send_command(connection, command.watch, command.param.as_deref())
                .await?;
            self.watched.insert(key);
        }
        Ok(())
    }

    async fn serve(&mut self, connection: &mut Box<dyn ChangesConnection>) -> Disconnect {
        loop {
            tokio::select! {
                opt_msg = self.receiver.recv() => match opt_msg {
                    None => return Disconnect::Closed(None),
                    Some(DatabaseChangesMessage::Close { respond_to }) => {
                        return Disconnect::Closed(Some(respond_to))
                    }
                    Some(DatabaseChangesMessage::Watch { key }) => {
                        if let Err(e) = self.watch(connection, &key).await {
                            return Disconnect::Lost(e);
                        }
                    }
                    Some(DatabaseChangesMessage::Unwatch { key, command }) => {
                        self.unwatch(connection, &key, &command).await;
                    }
                },
                frame = connection.receive() => match frame {
                    None => {
                        return Disconnect::Lost(DatabaseChangesError::ConnectionLost(
                            "closed by the server".to_string(),
                        ))
                    }
                    Some(Err(e)) => return Disconnect::Lost(e),
                    Some(Ok(frame)) => self.dispatch(&frame),
                },
            }
        }
    }

    async fn watch(
        &mut self,
        connection: &mut Box<dyn ChangesConnection>,
        key: &str,
    ) -> Result<(), DatabaseChangesError> {
        // Already released again, or watched when the connection opened.
        let Some(state) = self.registry.get(key) else {
            return Ok(());
        };
        if self.watched.contains(key) {
            return Ok(());
        }

        let command = state.watch_command().clone();
        self.send_command(connection, command.watch, command.param.as_deref())
            .await?;
        self.watched.insert(key.to_string());
        Ok(())
    }

    async fn unwatch(
        &mut self,
        connection: &mut Box<dyn ChangesConnection>,
        key: &str,
        command: &WatchCommand,
    ) {
        if !self.watched.remove(key) {
            return;
        }
        if let Err(e) = self
            .send_command(connection, command.unwatch, command.param.as_deref())
            .await
        {
            tracing::error!("Unable to unwatch {}. Caused by: {}", key, e);
        }
    }

    async fn send_command(
        &mut self,
        connection: &mut Box<dyn ChangesConnection>,
        command: &str,
        param: Option<&str>,
    ) -> Result<(), DatabaseChangesError> {
        self.command_id += 1;
        let frame = serde_json::to_string(&CommandFrame {
            command_id: self.command_id,
            command,
            param,
        })?;
        tracing::trace!(%frame, "Sending changes command");
        connection.send(frame).await
    }

    fn dispatch(&self, frame: &str) {
        let messages = match decode_frame(frame) {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!("Unable to decode changes frame. Caused by: {}", e);
                return;
            }
        };

        let states = self.registry.snapshot();
        for message in messages {
            match message {
                IncomingMessage::Notification(notification) => {
                    for (_, state) in &states {
                        state.send(&notification);
                    }
                }
                IncomingMessage::Error(message) => {
                    let error = DatabaseChangesError::ServerError(message);
                    for (_, state) in &states {
                        state.error(&error);
                    }
                }
                IncomingMessage::Ignored(kind) => {
                    tracing::trace!(?kind, "Ignoring changes message");
                }
            }
        }
    }

    /// Sleeps the reconnect delay plus some jitter. Returns `Err` when asked to close meanwhile.
    async fn wait_before_reconnect(&mut self) -> Result<(), Option<oneshot::Sender<()>>> {
        let max_jitter = self.reconnect_delay.as_millis() as u64 / 4;
        let jitter = rand::thread_rng().gen_range(0..=max_jitter);
        let sleep = tokio::time::sleep(self.reconnect_delay + Duration::from_millis(jitter));
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return Ok(()),
                opt_msg = self.receiver.recv() => match opt_msg {
                    None => return Err(None),
                    Some(DatabaseChangesMessage::Close { respond_to }) => {
                        return Err(Some(respond_to))
                    }
                    // Replayed from the registry once connected again.
                    Some(_) => {}
                },
            }
        }
    }

    fn finish(&mut self, respond_to: Option<oneshot::Sender<()>>) {
        self.status.send_replace(ConnectionStatus::Closed);
        if let Some(respond_to) = respond_to {
            let _ = respond_to.send(());
        }
    }
}

#[instrument(level = "debug", skip(request_executor, connector))]
async fn open_connection(
    request_executor: &RequestExecutor,
    connector: &dyn ChangesConnector,
    database: &str,
) -> Result<Box<dyn ChangesConnection>, DatabaseChangesError> {
    let node = request_executor.preferred_node().await?.current_node;
    let url = changes_url(&node.url, database)?;
    tracing::debug!(%url, "Connecting to changes endpoint");
    connector.connect(&url).await
}

#[instrument(
    level = "debug",
    name = "Running Database Changes Actor",
    skip(actor),
    fields(database = %actor.database)
)]
pub async fn run_database_changes_actor(mut actor: DatabaseChangesActor) {
    loop {
        actor.status.send_replace(ConnectionStatus::Connecting);

        let error = match actor.connect().await {
            Ok(mut connection) => {
                let disconnect = match actor.on_connected(&mut connection).await {
                    Ok(()) => {
                        actor.status.send_replace(ConnectionStatus::Connected);
                        tracing::info!("Changes connection established");
                        actor.serve(&mut connection).await
                    }
                    Err(e) => Disconnect::Lost(e),
                };
                connection.close().await;
                match disconnect {
                    Disconnect::Closed(respond_to) => {
                        actor.finish(respond_to);
                        break;
                    }
                    Disconnect::Lost(e) => e,
                }
            }
            Err(Disconnect::Closed(respond_to)) => {
                actor.finish(respond_to);
                break;
            }
            Err(Disconnect::Lost(e)) => e,
        };

        tracing::warn!("Changes connection failed, reconnecting. Caused by: {}", error);
        actor
            .status
            .send_replace(ConnectionStatus::Faulted(error.to_string()));
        for (_, state) in actor.registry.snapshot() {
            state.error(&error);
        }

        if let Err(respond_to) = actor.wait_before_reconnect().await {
            actor.finish(respond_to);
            break;
        }
    }

    tracing::debug!("Database changes actor stopped");
}
