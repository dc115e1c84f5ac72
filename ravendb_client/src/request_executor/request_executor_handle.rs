use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use arc_swap::ArcSwapOption;
use futures_util::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use parking_lot::Mutex;
use reqwest::{
    header::{HeaderValue, ETAG, IF_NONE_MATCH},
    Response, StatusCode, Url,
};
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    document_conventions::{DocumentConventions, ReadBalanceBehavior},
    http_cache::{CachedResponse, HttpCache},
    node_selector::{CurrentIndexAndNode, NodeSelector},
    raven_command::{RavenCommand, ResponseType},
    server_node::ServerNode,
    session_info::SessionInfo,
    topology::Topology,
};

use super::{
    request_executor_actor::run_request_executor_actor, RequestExecutorActor,
    RequestExecutorError, RequestExecutorMessage, RequestExecutorOptions,
};

const CLIENT_VERSION_HEADER: &str = "raven-client-version";
const DATABASE_MISSING_HEADER: &str = "database-missing";
const REFRESH_TOPOLOGY_HEADER: &str = "refresh-topology";
const TOPOLOGY_ETAG_HEADER: &str = "topology-etag";

/// Cluster tag given to nodes made up from seed urls rather than reported by a server.
pub(crate) const UNKNOWN_CLUSTER_TAG: &str = "!";

type FirstTopologyUpdate = Shared<BoxFuture<'static, Result<(), Arc<RequestExecutorError>>>>;

pub(crate) struct RequestExecutorInner {
    aggressive_caching: Mutex<Option<Duration>>,
    /// Allows the server to warn if the executor is being recreated too many times instead of
    /// once per application.
    pub(super) application_id: Uuid,
    pub(super) cache: Arc<HttpCache>,
    pub(super) conventions: DocumentConventions,
    pub(super) database: Option<String>,
    pub(super) disposed: AtomicBool,
    first_topology_update: Mutex<Option<FirstTopologyUpdate>>,
    pub(super) http_client: reqwest::Client,
    pub(super) is_cluster: bool,
    last_known_urls: Mutex<Vec<Url>>,
    last_returned_response: Mutex<Instant>,
    pub(super) node_selector: ArcSwapOption<NodeSelector>,
    number_of_server_requests: AtomicU64,
    sender: mpsc::UnboundedSender<RequestExecutorMessage>,
    pub(super) topology_etag: AtomicI64,
    pub(super) topology_taken_from_node: Mutex<Option<Arc<ServerNode>>>,
}

/// Routes commands to the nodes of one database (or of the cluster) and keeps the topology of
/// those nodes up to date.
///
/// Cloning is cheap, every clone talks to the same node selector, cache and background actor.
#[derive(Clone)]
pub struct RequestExecutor {
    pub(super) inner: Arc<RequestExecutorInner>,
}

impl std::fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("database", &self.inner.database)
            .field("is_cluster", &self.inner.is_cluster)
            .field("topology_etag", &self.topology_etag())
            .finish()
    }
}

/// Why a single attempt against one node did not produce a result.
enum AttemptError {
    /// The node could not serve the request, another node may.
    ServerDown { url: String, reason: String },
    /// The database moved away from the node.
    Gone { url: String, message: String },
    Fatal(RequestExecutorError),
}

impl From<RequestExecutorError> for AttemptError {
    fn from(e: RequestExecutorError) -> Self {
        AttemptError::Fatal(e)
    }
}

impl From<anyhow::Error> for AttemptError {
    fn from(e: anyhow::Error) -> Self {
        AttemptError::Fatal(RequestExecutorError::UnexpectedError(e))
    }
}

impl RequestExecutor {
    pub(super) fn new(
        database: Option<String>,
        conventions: DocumentConventions,
        options: RequestExecutorOptions,
        is_cluster: bool,
        node_selector: Option<NodeSelector>,
    ) -> Result<Self, RequestExecutorError> {
        // Reqwest client maintains an internal connection pool. Reuse it so long as this
        // RequestExecutor lives.
        let http_client = build_http_client(options)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let topology_etag = node_selector
            .as_ref()
            .map(|s| s.topology().etag)
            .unwrap_or_default();

        let inner = Arc::new(RequestExecutorInner {
            aggressive_caching: Mutex::new(None),
            application_id: Uuid::new_v4(),
            cache: Arc::new(HttpCache::new(conventions.max_http_cache_size())),
            database,
            disposed: AtomicBool::new(false),
            first_topology_update: Mutex::new(None),
            http_client,
            is_cluster,
            last_known_urls: Mutex::new(Vec::new()),
            last_returned_response: Mutex::new(Instant::now()),
            node_selector: ArcSwapOption::from(node_selector.map(Arc::new)),
            number_of_server_requests: AtomicU64::new(0),
            sender,
            topology_etag: AtomicI64::new(topology_etag),
            topology_taken_from_node: Mutex::new(None),
            conventions,
        });

        let actor = RequestExecutorActor::new(receiver, Arc::downgrade(&inner));
        tokio::spawn(run_request_executor_actor(actor));

        Ok(Self { inner })
    }

    /// Creates an executor for `database` and starts discovering its topology from
    /// `initial_urls`, tried in order.
    #[instrument(level = "debug", skip(conventions, options))]
    pub fn create(
        initial_urls: Vec<Url>,
        database: &str,
        conventions: DocumentConventions,
        options: RequestExecutorOptions,
    ) -> Result<Self, RequestExecutorError> {
        let initial_urls = validate_initial_urls(initial_urls)?;
        let executor = Self::new(
            Some(database.to_string()),
            conventions,
            options,
            false,
            None,
        )?;
        executor.start_first_topology_update(initial_urls);
        Ok(executor)
    }

    /// Creates an executor that talks to `url` only and never updates its topology.
    #[instrument(level = "debug", skip(conventions, options))]
    pub fn create_for_single_node(
        url: Url,
        database: &str,
        conventions: DocumentConventions,
        options: RequestExecutorOptions,
    ) -> Result<Self, RequestExecutorError> {
        let conventions = conventions.with_disable_topology_updates(true);
        let node = ServerNode::new(url.clone(), database.to_string())
            .with_cluster_tag(UNKNOWN_CLUSTER_TAG);
        let selector = NodeSelector::new(
            Topology::new(-1, vec![node]),
            conventions.fastest_node_reevaluation(),
        );

        let executor = Self::new(
            Some(database.to_string()),
            conventions,
            options,
            false,
            Some(selector),
        )?;
        *executor.inner.last_known_urls.lock() = vec![url];
        Ok(executor)
    }

    /// Creates an executor for server-wide commands, its topology comes from
    /// `/cluster/topology`.
    #[instrument(level = "debug", skip(conventions, options))]
    pub fn create_for_cluster(
        initial_urls: Vec<Url>,
        conventions: DocumentConventions,
        options: RequestExecutorOptions,
    ) -> Result<Self, RequestExecutorError> {
        let initial_urls = validate_initial_urls(initial_urls)?;
        let executor = Self::new(None, conventions, options, true, None)?;
        executor.start_first_topology_update(initial_urls);
        Ok(executor)
    }

    pub fn cache(&self) -> Arc<HttpCache> {
        self.inner.cache.clone()
    }

    pub fn aggressive_caching(&self) -> Option<Duration> {
        *self.inner.aggressive_caching.lock()
    }

    /// Serves cached responses younger than `duration` without asking the server, as long as
    /// the cache generation did not move since they were stored. `None` turns it off.
    ///
    /// Returns the previous setting. Only safe while something bumps the cache generation on
    /// changes, see [`CacheEvictionBridge`](crate::cache_eviction::CacheEvictionBridge).
    pub fn set_aggressive_caching(&self, duration: Option<Duration>) -> Option<Duration> {
        std::mem::replace(&mut *self.inner.aggressive_caching.lock(), duration)
    }

    pub fn conventions(&self) -> &DocumentConventions {
        &self.inner.conventions
    }

    pub fn database(&self) -> Option<&str> {
        self.inner.database.as_deref()
    }

    pub fn is_cluster(&self) -> bool {
        self.inner.is_cluster
    }

    pub fn node_selector(&self) -> Option<Arc<NodeSelector>> {
        self.inner.node_selector.load_full()
    }

    pub fn topology(&self) -> Option<Arc<Topology>> {
        self.node_selector().map(|s| s.topology())
    }

    pub fn topology_nodes(&self) -> Vec<Arc<ServerNode>> {
        self.topology()
            .map(|t| t.nodes.clone())
            .unwrap_or_default()
    }

    pub fn topology_etag(&self) -> i64 {
        self.inner.topology_etag.load(Ordering::Acquire)
    }

    /// Node the current topology was downloaded from.
    pub fn topology_taken_from_node(&self) -> Option<Arc<ServerNode>> {
        self.inner.topology_taken_from_node.lock().clone()
    }

    pub fn number_of_server_requests(&self) -> u64 {
        self.inner.number_of_server_requests.load(Ordering::Acquire)
    }

    pub fn in_speed_test_phase(&self) -> bool {
        self.node_selector()
            .map(|s| s.in_speed_test_phase())
            .unwrap_or(false)
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Waits for the first topology update, then returns the preferred node.
    pub async fn preferred_node(&self) -> Result<CurrentIndexAndNode, RequestExecutorError> {
        self.ensure_first_topology_update().await?;
        Ok(self.require_node_selector()?.get_preferred_node()?)
    }

    /// Sends `command` to the node chosen for it and fails over to other nodes when needed.
    #[instrument(level = "debug", skip(self, command))]
    pub async fn execute_command<C: RavenCommand>(
        &self,
        command: &mut C,
        session_info: Option<&SessionInfo>,
    ) -> Result<(), RequestExecutorError> {
        if self.is_disposed() {
            return Err(RequestExecutorError::Disposed);
        }

        self.ensure_first_topology_update().await?;

        let chosen = self.choose_node_for_request(command, session_info)?;
        self.execute_with_node(
            chosen.current_node,
            Some(chosen.current_index),
            command,
            true,
            session_info,
        )
        .await
    }

    /// Sends `command` to `node`.
    ///
    /// `node_index` is the position of `node` in the current topology. Without it, or with
    /// `should_retry` unset, a node failure is reported to the caller instead of failing over.
    pub async fn execute_with_node<C: RavenCommand>(
        &self,
        node: Arc<ServerNode>,
        node_index: Option<usize>,
        command: &mut C,
        should_retry: bool,
        session_info: Option<&SessionInfo>,
    ) -> Result<(), RequestExecutorError> {
        let mut chosen = CurrentIndexAndNode {
            current_index: node_index.unwrap_or_default(),
            current_node: node,
        };
        let mut node_index = node_index;
        let mut should_retry = should_retry;
        let mut failed_nodes: Vec<(Arc<ServerNode>, String)> = Vec::new();

        loop {
            let node = chosen.current_node.clone();
            match self.execute_once(&node, command).await {
                Ok(()) => return Ok(()),
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::ServerDown { url, reason }) => {
                    tracing::warn!(%url, %reason, "Request failed on node");
                    failed_nodes.push((node.clone(), reason.clone()));

                    let Some(index) = node_index else {
                        return Err(RequestExecutorError::ServerDown { url, reason });
                    };
                    let selector = self.require_node_selector()?;
                    selector.on_failed_request(index);
                    self.spawn_health_check(index, node);

                    if !should_retry {
                        return Err(RequestExecutorError::ServerDown { url, reason });
                    }

                    match self.choose_failover_node(command, session_info, &failed_nodes)? {
                        Some(next) => {
                            tracing::debug!(url = %next.current_node.url, "Failing over");
                            node_index = Some(next.current_index);
                            chosen = next;
                        }
                        None if failed_nodes.len() == 1 => {
                            return Err(RequestExecutorError::ServerDown { url, reason });
                        }
                        None => return Err(self.all_topology_nodes_down(&failed_nodes)),
                    }
                }
                Err(AttemptError::Gone { url, message }) => {
                    if !should_retry {
                        return Err(RequestExecutorError::ServerError {
                            url,
                            status: StatusCode::GONE.as_u16(),
                            message,
                        });
                    }

                    tracing::debug!(%url, "Database moved away from node, refreshing topology");
                    self.update_topology(node, true).await?;

                    chosen = self.choose_node_for_request(command, session_info)?;
                    node_index = Some(chosen.current_index);
                    should_retry = false;
                }
            }
        }
    }

    fn choose_node_for_request<C: RavenCommand>(
        &self,
        command: &C,
        session_info: Option<&SessionInfo>,
    ) -> Result<CurrentIndexAndNode, RequestExecutorError> {
        let selector = self.require_node_selector()?;
        if !command.is_read_request() {
            return Ok(selector.get_preferred_node()?);
        }

        let chosen = match self.inner.conventions.read_balance_behavior() {
            ReadBalanceBehavior::None => selector.get_preferred_node()?,
            ReadBalanceBehavior::RoundRobin => selector
                .get_node_by_session_id(session_info.map(|s| s.session_id).unwrap_or_default())?,
            ReadBalanceBehavior::FastestNode => selector.get_fastest_node()?,
        };
        Ok(chosen)
    }

    // Re-evaluates the read balance behavior, then falls back to the preferred node. `None`
    // when both point at nodes that already failed this command.
    fn choose_failover_node<C: RavenCommand>(
        &self,
        command: &C,
        session_info: Option<&SessionInfo>,
        failed_nodes: &[(Arc<ServerNode>, String)],
    ) -> Result<Option<CurrentIndexAndNode>, RequestExecutorError> {
        let already_failed = |candidate: &CurrentIndexAndNode| {
            failed_nodes.iter().any(|(node, _)| {
                node.url == candidate.current_node.url
                    && node.database == candidate.current_node.database
            })
        };

        let next = self.choose_node_for_request(command, session_info)?;
        if !already_failed(&next) {
            return Ok(Some(next));
        }

        let preferred = self.require_node_selector()?.get_preferred_node()?;
        if !already_failed(&preferred) {
            return Ok(Some(preferred));
        }
        Ok(None)
    }

    fn all_topology_nodes_down(
        &self,
        failed_nodes: &[(Arc<ServerNode>, String)],
    ) -> RequestExecutorError {
        let tried = failed_nodes
            .iter()
            .map(|(node, reason)| format!("{} ({})", node.url, reason))
            .collect::<Vec<_>>()
            .join(", ");
        let mut message = format!(
            "Tried to send the request to all configured nodes in the topology, all of them seem to be down or not responding. I've tried to access the following nodes: {}",
            tried
        );

        if let Some(source) = self.topology_taken_from_node() {
            let nodes = self
                .topology_nodes()
                .iter()
                .map(|n| {
                    format!(
                        "( url: {}, clusterTag: {}, serverRole: {:?})",
                        n.url, n.cluster_tag, n.server_role
                    )
                })
                .collect::<Vec<_>>()
                .join(", ");
            message.push_str(&format!(
                "\nI was able to fetch {} topology from {}.\nFetched topology: {}",
                source.database, source.url, nodes
            ));
        }

        RequestExecutorError::AllTopologyNodesDown(message)
    }

    /// Sends `command` to `node` once. Caching, status classification and topology refresh
    /// signals are handled here, failover is up to the caller.
    async fn execute_once<C: RavenCommand>(
        &self,
        node: &Arc<ServerNode>,
        command: &mut C,
    ) -> Result<(), AttemptError> {
        let mut request = self.create_request(node, command)?;
        let url = request.url().to_string();

        let fingerprint = (command.can_cache()
            && command.is_read_request()
            && command.response_type() == ResponseType::Object)
            .then(|| command.fingerprint(&request))
            .flatten();
        let cached = fingerprint
            .as_deref()
            .and_then(|fp| self.inner.cache.lookup(fp));
        let cached_change_vector = cached
            .as_ref()
            .and_then(|c| c.item.change_vector.clone());
        if let (Some(cached), Some(_)) = (&cached, &cached_change_vector) {
            if self.can_serve_aggressively(cached, &*command) {
                tracing::trace!(%url, "Serving response from the aggressive cache");
                command.set_response(cached.item.payload.as_deref(), true)?;
                return Ok(());
            }
        }
        if let Some(change_vector) = &cached_change_vector {
            request
                .headers_mut()
                .insert(IF_NONE_MATCH, quoted_header_value(change_vector)?);
        }

        self.inner
            .number_of_server_requests
            .fetch_add(1, Ordering::AcqRel);
        let response = if self.should_execute_on_all(node, command) {
            self.execute_on_all_to_figure_out_the_fastest(
                node,
                command,
                cached_change_vector.as_deref(),
            )
            .await
        } else {
            self.inner
                .http_client
                .execute(request)
                .await
                .map_err(anyhow::Error::from)
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                return Err(AttemptError::ServerDown {
                    url,
                    reason: format!("{:#}", e),
                })
            }
        };

        if let Some(database) = header_str(&response, DATABASE_MISSING_HEADER) {
            return Err(RequestExecutorError::DatabaseDoesNotExist(database.to_string()).into());
        }

        let status = response.status();
        tracing::trace!(%url, %status, "Received response");

        if status == StatusCode::NOT_MODIFIED {
            if let Some(fp) = &fingerprint {
                self.inner.cache.not_modified(fp);
            }
            if command.response_type() == ResponseType::Object {
                let payload = cached.and_then(|c| c.item.payload);
                command.set_response(payload.as_deref(), true)?;
            }
            self.touch_last_returned_response();
            return Ok(());
        }

        if status.is_client_error() || status.is_server_error() {
            return self
                .handle_unsuccessful_response(node, command, response, url, fingerprint)
                .await;
        }

        let refresh_topology = header_str(&response, REFRESH_TOPOLOGY_HEADER)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let change_vector = header_str(&response, ETAG.as_str())
            .map(|v| v.trim_matches('"').to_string());

        if command.response_type() == ResponseType::Object {
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    return Err(AttemptError::ServerDown {
                        url,
                        reason: e.to_string(),
                    })
                }
            };
            let body = (!body.is_empty()).then_some(body);
            if let (Some(fp), Some(payload)) = (&fingerprint, &body) {
                self.inner.cache.set(fp, change_vector, Some(payload.as_str()));
            }
            command.set_response(body.as_deref(), false)?;
        }
        self.touch_last_returned_response();

        if refresh_topology && !self.inner.conventions.disable_topology_updates() {
            // Not awaited, the update may itself run on this call stack.
            tracing::debug!(%url, "Server requested a topology refresh");
            self.request_topology_update(node.clone());
        }

        Ok(())
    }

    fn can_serve_aggressively<C: RavenCommand>(
        &self,
        cached: &CachedResponse,
        command: &C,
    ) -> bool {
        match self.aggressive_caching() {
            Some(duration) => {
                !cached.might_have_been_modified
                    && cached.item.age() <= duration
                    && command.can_cache_aggressively()
            }
            None => false,
        }
    }

    async fn handle_unsuccessful_response<C: RavenCommand>(
        &self,
        node: &Arc<ServerNode>,
        command: &mut C,
        response: Response,
        url: String,
        fingerprint: Option<String>,
    ) -> Result<(), AttemptError> {
        let status = response.status();
        let method_and_url = url.clone();
        match status {
            StatusCode::NOT_FOUND => {
                if let Some(fp) = &fingerprint {
                    self.inner.cache.set_not_found(fp);
                }
                if command.response_type() == ResponseType::Object {
                    command.set_response(None, false)?;
                }
                self.touch_last_returned_response();
                return Ok(());
            }
            StatusCode::FORBIDDEN => {
                return Err(RequestExecutorError::AuthorizationFailed(format!(
                    "Forbidden access to {}@{}, {}",
                    node.database, node.url, method_and_url
                ))
                .into());
            }
            _ => {}
        }

        let message = response.text().await.unwrap_or_default();
        let error = match status {
            StatusCode::GONE => return Err(AttemptError::Gone { url, message }),
            StatusCode::REQUEST_TIMEOUT => {
                return Err(AttemptError::ServerDown {
                    url,
                    reason: format!("{} {}", status, message),
                })
            }
            s if s.is_server_error() => {
                return Err(AttemptError::ServerDown {
                    url,
                    reason: format!("{} {}", status, message),
                })
            }
            StatusCode::CONFLICT => RequestExecutorError::Conflict { url, message },
            StatusCode::BAD_REQUEST => RequestExecutorError::BadRequest { url, message },
            _ => RequestExecutorError::ServerError {
                url,
                status: status.as_u16(),
                message,
            },
        };
        Err(error.into())
    }

    /// Builds the request for `node` with the headers every request carries.
    fn create_request<C: RavenCommand>(
        &self,
        node: &ServerNode,
        command: &C,
    ) -> Result<reqwest::Request, RequestExecutorError> {
        let mut request = command.create_request(&self.inner.http_client, node)?;
        let headers = request.headers_mut();
        headers.insert(
            CLIENT_VERSION_HEADER,
            HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
        );
        if !self.inner.conventions.disable_topology_updates() {
            headers.insert(
                TOPOLOGY_ETAG_HEADER,
                quoted_header_value(&self.topology_etag().to_string())?,
            );
        }
        *request.timeout_mut() = Some(
            command
                .timeout()
                .unwrap_or_else(|| self.inner.conventions.request_timeout()),
        );
        Ok(request)
    }

    fn should_execute_on_all<C: RavenCommand>(&self, _node: &ServerNode, command: &C) -> bool {
        let Some(selector) = self.node_selector() else {
            return false;
        };
        self.inner.conventions.read_balance_behavior() == ReadBalanceBehavior::FastestNode
            && selector.in_speed_test_phase()
            && selector.topology().nodes.len() > 1
            && command.is_read_request()
            && command.response_type() == ResponseType::Object
    }

    /// Sends the request to every node at once. The first node to answer gets a speed-test
    /// vote, the caller gets the answer of `chosen`.
    async fn execute_on_all_to_figure_out_the_fastest<C: RavenCommand>(
        &self,
        chosen: &Arc<ServerNode>,
        command: &C,
        cached_change_vector: Option<&str>,
    ) -> anyhow::Result<Response> {
        let selector = self.require_node_selector()?;
        let topology = selector.topology();
        let recorded = Arc::new(AtomicBool::new(false));
        let mut chosen_response = None;

        for (index, node) in topology.nodes.iter().enumerate() {
            let mut request = self.create_request(node, command)?;
            if let Some(change_vector) = cached_change_vector {
                request
                    .headers_mut()
                    .insert(IF_NONE_MATCH, quoted_header_value(change_vector)?);
            }
            if !Arc::ptr_eq(node, chosen) {
                self.inner
                    .number_of_server_requests
                    .fetch_add(1, Ordering::AcqRel);
            }

            let client = self.inner.http_client.clone();
            let selector = selector.clone();
            let recorded = recorded.clone();
            let node = node.clone();
            let is_chosen = node.url == chosen.url;
            let task = tokio::spawn(async move {
                let response = client.execute(request).await;
                if !recorded.swap(true, Ordering::AcqRel) {
                    selector.record_fastest(index, &node);
                }
                response
            });
            if is_chosen && chosen_response.is_none() {
                chosen_response = Some(task);
            }
        }

        let task = chosen_response.context("Chosen node is not part of the current topology")?;
        let response = tokio::time::timeout(self.inner.conventions.speed_test_timeout(), task)
            .await
            .context("Request timed out")?
            .context("Speed test request task failed")??;
        Ok(response)
    }

    pub(super) fn touch_last_returned_response(&self) {
        *self.inner.last_returned_response.lock() = Instant::now();
    }

    pub(crate) fn last_returned_response(&self) -> Instant {
        *self.inner.last_returned_response.lock()
    }

    fn require_node_selector(&self) -> Result<Arc<NodeSelector>, RequestExecutorError> {
        self.node_selector().ok_or_else(|| {
            RequestExecutorError::UnexpectedError(anyhow::anyhow!(
                "No topology is available yet"
            ))
        })
    }

    fn spawn_health_check(&self, node_index: usize, node: Arc<ServerNode>) {
        let _ = self
            .inner
            .sender
            .send(RequestExecutorMessage::NodeFailed { node_index, node });
    }

    fn request_topology_update(&self, node: Arc<ServerNode>) {
        let _ = self.inner.sender.send(RequestExecutorMessage::UpdateTopology {
            node,
            force_update: false,
            respond_to: None,
        });
    }

    /// Fetches the topology from `node` and adopts it if it is newer, or unconditionally with
    /// `force_update`. Returns whether the topology was replaced.
    #[instrument(level = "debug", skip(self))]
    pub async fn update_topology(
        &self,
        node: Arc<ServerNode>,
        force_update: bool,
    ) -> Result<bool, RequestExecutorError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .sender
            .send(RequestExecutorMessage::UpdateTopology {
                node,
                force_update,
                respond_to: Some(tx),
            })
            .map_err(|_| RequestExecutorError::Disposed)?;
        rx.await.map_err(|_| RequestExecutorError::Disposed)?
    }

    fn start_first_topology_update(&self, initial_urls: Vec<Url>) {
        let mut slot = self.inner.first_topology_update.lock();
        self.spawn_first_topology_update(&mut slot, initial_urls);
    }

    fn spawn_first_topology_update(
        &self,
        slot: &mut Option<FirstTopologyUpdate>,
        initial_urls: Vec<Url>,
    ) {
        let executor = self.clone();
        let update = async move {
            executor
                .first_topology_update(initial_urls)
                .await
                .map_err(Arc::new)
        }
        .boxed()
        .shared();

        *slot = Some(update.clone());
        tokio::spawn(update);
    }

    /// Waits for the bootstrap. A bootstrap that failed is started again from the last known
    /// urls, so one unreachable cluster does not poison the executor forever.
    async fn ensure_first_topology_update(&self) -> Result<(), RequestExecutorError> {
        let pending = {
            let mut slot = self.inner.first_topology_update.lock();
            let failed = slot
                .as_ref()
                .and_then(|update| update.peek())
                .map(|result| result.is_err())
                .unwrap_or(false);
            if failed {
                let urls = self.inner.last_known_urls.lock().clone();
                tracing::debug!("Previous topology bootstrap failed, starting a new one");
                self.spawn_first_topology_update(&mut slot, urls);
            }
            slot.clone()
        };

        match pending {
            Some(update) => update.await.map_err(|e| e.for_waiter()),
            None => Ok(()),
        }
    }

    #[instrument(level = "debug", skip(self))]
    async fn first_topology_update(
        &self,
        initial_urls: Vec<Url>,
    ) -> Result<(), RequestExecutorError> {
        let database = self.inner.database.clone().unwrap_or_default();
        let mut server_errors = Vec::new();

        for url in &initial_urls {
            let node = Arc::new(ServerNode::new(url.clone(), database.clone()));
            match self.update_topology(node, false).await {
                Ok(_) => {
                    tracing::info!(%url, "Initial topology update complete");
                    *self.inner.last_known_urls.lock() = initial_urls.clone();
                    return Ok(());
                }
                Err(RequestExecutorError::DatabaseDoesNotExist(database)) => {
                    *self.inner.last_known_urls.lock() = initial_urls.clone();
                    return Err(RequestExecutorError::DatabaseDoesNotExist(database));
                }
                Err(e) => {
                    tracing::warn!(%url, error = %e, "Unable to fetch topology from seed node");
                    server_errors.push((url.clone(), e));
                }
            }
        }

        // None of the seeds answered. Keep whatever topology we already know, otherwise make
        // one up from the seeds and hope they come online.
        if self.node_selector().is_none() {
            let nodes = initial_urls
                .iter()
                .map(|url| {
                    ServerNode::new(url.clone(), database.clone())
                        .with_cluster_tag(UNKNOWN_CLUSTER_TAG)
                })
                .collect::<Vec<_>>();
            let selector = NodeSelector::new(
                Topology::new(-1, nodes),
                self.inner.conventions.fastest_node_reevaluation(),
            );
            self.inner.node_selector.store(Some(Arc::new(selector)));
        }
        *self.inner.last_known_urls.lock() = initial_urls;

        let details = server_errors
            .iter()
            .map(|(url, e)| format!("{} -> {}", url, e))
            .collect::<Vec<_>>()
            .join(", ");
        tracing::error!(%details, "Failed to retrieve topology from all seed nodes");
        Err(RequestExecutorError::FirstTopologyUpdateFailed { details })
    }

    /// Stops the background work of this executor. Commands already running are not aborted
    /// but new ones fail with [`RequestExecutorError::Disposed`].
    #[instrument(level = "debug", skip(self))]
    pub async fn close(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(selector) = self.node_selector() {
            selector.close();
        }

        let (tx, rx) = oneshot::channel();
        if self
            .inner
            .sender
            .send(RequestExecutorMessage::Close { respond_to: tx })
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

fn quoted_header_value(value: &str) -> anyhow::Result<HeaderValue> {
    HeaderValue::from_str(&format!("\"{}\"", value))
        .with_context(|| format!("Invalid header value: {}", value))
}

fn header_str<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

fn validate_initial_urls(initial_urls: Vec<Url>) -> Result<Vec<Url>, RequestExecutorError> {
    if initial_urls.is_empty() {
        return Err(RequestExecutorError::UnexpectedError(anyhow::anyhow!(
            "At least one url is required to discover the topology"
        )));
    }
    Ok(initial_urls)
}

#[instrument(level = "debug", skip(options))]
fn build_http_client(options: RequestExecutorOptions) -> anyhow::Result<reqwest::Client> {
    let mut client = reqwest::Client::builder();

    if let Some(identity) = options.client_identity {
        client = client.identity(identity).use_rustls_tls();
    }

    // Convert Option<HashMap<String, IpAddr>> into HashMap<String,SocketAddr>
    let overrides = options
        .dns_overrides
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, SocketAddr::new(v, 0)))
        .collect::<HashMap<String, SocketAddr>>();

    for (domain, address) in overrides {
        tracing::trace!(
            "Adding `{}->{}` to dns overrides for this client.",
            domain,
            address
        );
        client = client.resolve(domain.as_str(), address);
    }

    if let Some(proxy) = options.proxy_address {
        tracing::trace!("Proxy set to `{}`", &proxy);
        client = client.proxy(reqwest::Proxy::http(proxy)?);
    } else {
        tracing::trace!("No proxy defined. Using system settings.");
    }

    Ok(client.build()?)
}
