use std::{
    collections::HashMap,
    sync::{atomic::Ordering, Arc, Weak},
    time::Duration,
};

use anyhow::Context;
use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};
use tracing::instrument;

use crate::{
    document_conventions::ReadBalanceBehavior,
    node_selector::NodeSelector,
    raven_command::{GetClusterTopologyCommand, GetDatabaseTopologyCommand, HealthCheckCommand},
    server_node::ServerNode,
    topology::Topology,
};

use super::{
    request_executor_handle::RequestExecutorInner, RequestExecutor, RequestExecutorError,
    RequestExecutorMessage,
};

const HEALTH_CHECK_STEP: Duration = Duration::from_millis(100);
const MAX_HEALTH_CHECK_PERIOD: Duration = Duration::from_secs(5);

/// Serializes topology updates and owns the background work of one executor: the periodic
/// topology refresh and the health checks of failed nodes.
///
/// Only holds a weak reference to the executor, so it stops once the last handle is gone.
pub struct RequestExecutorActor {
    executor: Weak<RequestExecutorInner>,
    failed_nodes_timers: HashMap<String, JoinHandle<()>>,
    receiver: mpsc::UnboundedReceiver<RequestExecutorMessage>,
}

impl RequestExecutorActor {
    pub(crate) fn new(
        receiver: mpsc::UnboundedReceiver<RequestExecutorMessage>,
        executor: Weak<RequestExecutorInner>,
    ) -> Self {
        Self {
            executor,
            failed_nodes_timers: HashMap::default(),
            receiver,
        }
    }

    fn executor(&self) -> Option<RequestExecutor> {
        self.executor
            .upgrade()
            .map(|inner| RequestExecutor { inner })
    }

    async fn handle_message(&mut self, msg: RequestExecutorMessage) {
        match msg {
            RequestExecutorMessage::UpdateTopology {
                node,
                force_update,
                respond_to,
            } => {
                let result = self.update_topology(node, force_update).await;
                match respond_to {
                    Some(respond_to) => {
                        let _ = respond_to.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            tracing::error!("Background topology update failed. Caused by: {}", e);
                        }
                    }
                }
            }
            RequestExecutorMessage::NodeFailed { node_index, node } => {
                self.spawn_health_check(node_index, node);
            }
            // Handled by the run loop.
            RequestExecutorMessage::Close { .. } => {}
        }
    }

    #[instrument(level = "debug", skip(self))]
    async fn update_topology(
        &mut self,
        node: Arc<ServerNode>,
        force_update: bool,
    ) -> Result<bool, RequestExecutorError> {
        let executor = match self.executor() {
            Some(executor) if !executor.is_disposed() => executor,
            _ => return Ok(false),
        };

        let topology = fetch_topology(&executor, node.clone()).await?;

        let inner = &executor.inner;
        let (selector, updated) = match inner.node_selector.load_full() {
            Some(selector) => {
                let updated = selector.on_update_topology(topology, force_update);
                (selector, updated)
            }
            None => {
                let selector = Arc::new(NodeSelector::new(
                    topology,
                    inner.conventions.fastest_node_reevaluation(),
                ));
                inner.node_selector.store(Some(selector.clone()));
                (selector, true)
            }
        };

        if updated {
            self.dispose_all_failed_nodes_timers();
            if inner.conventions.read_balance_behavior() == ReadBalanceBehavior::FastestNode {
                selector.schedule_speed_test();
            }
        }

        inner
            .topology_etag
            .store(selector.topology().etag, Ordering::Release);
        *inner.topology_taken_from_node.lock() = Some(node);

        Ok(updated)
    }

    /// Refreshes the topology from the preferred node, unless a response came back recently.
    async fn on_update_topology_timer(&mut self, interval: Duration) {
        let Some(executor) = self.executor() else {
            return;
        };
        if executor.is_disposed() {
            return;
        }
        if executor.last_returned_response().elapsed() < interval {
            tracing::trace!("Skipping topology update, a response was returned recently");
            return;
        }

        let node = match executor.node_selector().map(|s| s.get_preferred_node()) {
            Some(Ok(chosen)) => chosen.current_node,
            Some(Err(e)) => {
                tracing::error!(
                    "Unable to choose a node for the topology update. Caused by: {}",
                    e
                );
                return;
            }
            None => return,
        };

        tracing::debug!("Updating topology via timer.");
        if let Err(e) = self.update_topology(node, false).await {
            tracing::error!(
                "There was an error updating the topology. Caused by: {}",
                e
            );
        }
    }

    fn spawn_health_check(&mut self, node_index: usize, node: Arc<ServerNode>) {
        let key = node.url.to_string();
        if self
            .failed_nodes_timers
            .get(&key)
            .map(|timer| !timer.is_finished())
            .unwrap_or(false)
        {
            return;
        }

        tracing::debug!(url = %node.url, "Starting health checks for failed node");
        let timer = tokio::spawn(run_health_check(self.executor.clone(), node_index, node));
        self.failed_nodes_timers.insert(key, timer);
    }

    fn dispose_all_failed_nodes_timers(&mut self) {
        for (_, timer) in self.failed_nodes_timers.drain() {
            timer.abort();
        }
    }
}

async fn fetch_topology(
    executor: &RequestExecutor,
    node: Arc<ServerNode>,
) -> Result<Topology, RequestExecutorError> {
    let topology = if executor.is_cluster() {
        let mut command = GetClusterTopologyCommand::new(None);
        executor
            .execute_with_node(node, None, &mut command, false, None)
            .await?;
        command
            .into_result()
            .context("Cluster topology response was empty")?
            .into_topology()
    } else {
        let mut command =
            GetDatabaseTopologyCommand::new(Some(executor.inner.application_id), None);
        executor
            .execute_with_node(node, None, &mut command, false, None)
            .await?;
        command
            .into_result()
            .context("Database topology response was empty")?
    };
    Ok(topology)
}

/// Checks a failed node with a growing delay until it answers, then makes it preferable again.
///
/// Stops silently when the topology changed and `node_index` no longer holds `node`.
#[instrument(level = "debug", skip(executor, node), fields(url = %node.url))]
async fn run_health_check(
    executor: Weak<RequestExecutorInner>,
    node_index: usize,
    node: Arc<ServerNode>,
) {
    let mut period = HEALTH_CHECK_STEP;
    loop {
        tokio::time::sleep(period).await;

        let Some(inner) = executor.upgrade() else {
            return;
        };
        let executor = RequestExecutor { inner };
        if executor.is_disposed() {
            return;
        }
        let Some(selector) = executor.node_selector() else {
            return;
        };
        let still_in_topology = selector
            .topology()
            .nodes
            .get(node_index)
            .map(|current| Arc::ptr_eq(current, &node))
            .unwrap_or(false);
        if !still_in_topology {
            return;
        }

        let mut command = if executor.is_cluster() {
            HealthCheckCommand::for_cluster()
        } else {
            HealthCheckCommand::for_database()
        };
        match executor
            .execute_with_node(node.clone(), None, &mut command, false, None)
            .await
        {
            Ok(()) => {
                tracing::info!("Node is reachable again");
                selector.restore_node_index(node_index);
                return;
            }
            Err(e) => {
                tracing::debug!("Health check failed. Caused by: {}", e);
                period = (period + HEALTH_CHECK_STEP).min(MAX_HEALTH_CHECK_PERIOD);
            }
        }
    }
}

#[instrument(level = "debug", name = "Running Request Executor Actor", skip(actor))]
pub async fn run_request_executor_actor(mut actor: RequestExecutorActor) {
    let update_interval = match actor.executor() {
        Some(executor) if !executor.conventions().disable_topology_updates() => {
            Some(executor.conventions().topology_update_interval())
        }
        _ => None,
    };

    let mut topology_update_timer =
        tokio::time::interval(update_interval.unwrap_or(Duration::from_secs(60)));
    topology_update_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately, the bootstrap covers it.
    topology_update_timer.tick().await;

    loop {
        tokio::select! {
            _ = topology_update_timer.tick(), if update_interval.is_some() => {
                if let Some(interval) = update_interval {
                    actor.on_update_topology_timer(interval).await;
                }
            },
            opt_msg = actor.receiver.recv() => {
                let msg = match opt_msg {
                    Some(RequestExecutorMessage::Close { respond_to }) => {
                        actor.dispose_all_failed_nodes_timers();
                        let _ = respond_to.send(());
                        break;
                    }
                    Some(msg) => msg,
                    None => break,
                };
                actor.handle_message(msg).await;
            },
        }
    }

    actor.dispose_all_failed_nodes_timers();
    tracing::debug!("Request executor actor stopped");
}

#[cfg(test)]
mod tests {
    use reqwest::Url;
    use serde_json::json;
    use wiremock::{matchers::path, Mock, MockServer, ResponseTemplate};

    use crate::{
        document_conventions::DocumentConventions,
        request_executor::RequestExecutorOptions,
    };

    use super::*;

    /// An executor that already knows its topology, so only the refresh timer talks to the node.
    ///
    /// Nothing listens on the discard port: a refresh is counted, then fails.
    fn executor_with_topology(update_interval: Duration) -> RequestExecutor {
        let conventions =
            DocumentConventions::default().with_topology_update_interval(update_interval);
        let node = ServerNode::new(Url::parse("http://127.0.0.1:9").unwrap(), "db".to_string());
        let selector = NodeSelector::new(
            Topology::new(1, vec![node]),
            conventions.fastest_node_reevaluation(),
        );
        RequestExecutor::new(
            Some("db".to_string()),
            conventions,
            RequestExecutorOptions::default(),
            false,
            Some(selector),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn topology_timer_refreshes_after_a_quiet_interval() {
        let executor = executor_with_topology(Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(59)).await;
        let before_interval = executor.number_of_server_requests();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(before_interval, 0);
        assert_eq!(executor.number_of_server_requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn topology_timer_skips_refresh_while_responses_keep_coming() {
        let executor = executor_with_topology(Duration::from_secs(60));

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_secs(30)).await;
            executor.touch_last_returned_response();
        }

        assert_eq!(executor.number_of_server_requests(), 0);
    }

    #[tokio::test]
    async fn health_check_restores_node_once_it_answers() {
        let server = MockServer::start().await;
        Mock::given(path("/databases/db/stats"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        let executor = RequestExecutor::create_for_single_node(
            Url::parse(&server.uri()).unwrap(),
            "db",
            DocumentConventions::default(),
            RequestExecutorOptions::default(),
        )
        .unwrap();
        let selector = executor.node_selector().unwrap();
        let node = selector.topology().nodes[0].clone();
        selector.on_failed_request(0);

        run_health_check(Arc::downgrade(&executor.inner), 0, node).await;

        assert_eq!(selector.state().failures(0), Some(0));
    }

    #[tokio::test]
    async fn health_check_stops_when_node_left_the_topology() {
        let server = MockServer::start().await;
        Mock::given(path("/databases/db/stats"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let executor = RequestExecutor::create_for_single_node(
            Url::parse(&server.uri()).unwrap(),
            "db",
            DocumentConventions::default(),
            RequestExecutorOptions::default(),
        )
        .unwrap();
        let stranger = Arc::new(ServerNode::new(
            Url::parse(&server.uri()).unwrap(),
            "db".to_string(),
        ));

        run_health_check(Arc::downgrade(&executor.inner), 0, stranger).await;
    }

    #[tokio::test]
    async fn update_topology_adopts_newer_topology_only() {
        let server = MockServer::start().await;
        let topology = |etag: i64| {
            json!({
                "Etag": etag,
                "Nodes": [{ "Url": server.uri(), "ClusterTag": "A", "Database": "db", "ServerRole": "Member" }]
            })
        };
        Mock::given(path("/topology"))
            .respond_with(ResponseTemplate::new(200).set_body_json(topology(3)))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(path("/topology"))
            .respond_with(ResponseTemplate::new(200).set_body_json(topology(2)))
            .mount(&server)
            .await;
        let executor = RequestExecutor::create(
            vec![Url::parse(&server.uri()).unwrap()],
            "db",
            DocumentConventions::default(),
            RequestExecutorOptions::default(),
        )
        .unwrap();
        let node = executor.preferred_node().await.unwrap().current_node;

        let same = executor.update_topology(node.clone(), false).await.unwrap();
        let older = executor.update_topology(node.clone(), false).await.unwrap();
        let forced = executor.update_topology(node, true).await.unwrap();

        assert!(!same);
        assert!(!older);
        assert!(forced);
        assert_eq!(executor.topology_etag(), 2);
    }
}
