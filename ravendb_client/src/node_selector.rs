//! Chooses which node of the current topology receives a request.
//!
//! The selector publishes one immutable [`NodeSelectorState`] per adopted topology through an
//! [`ArcSwap`]. Every operation loads the state once and works only on that snapshot, so a
//! concurrent topology swap can never hand out an index that is out of range for the nodes the
//! caller is looking at. Failure and speed-test counters are independent atomics inside the
//! snapshot and are thrown away together with it.

use std::{
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::{
    error_chain_fmt,
    server_node::{ServerNode, ServerRole},
    topology::Topology,
};

/// Wins a node needs in a speed test to be declared the fastest.
const FASTEST_NODE_WINS: u32 = 10;
/// Speed-test rounds allowed per node before the current leader is picked regardless.
const SPEED_TEST_ROUNDS_PER_NODE: usize = 10;

/// A node together with its position in the topology it was selected from.
#[derive(Debug, Clone)]
pub struct CurrentIndexAndNode {
    pub current_index: usize,
    pub current_node: Arc<ServerNode>,
}

impl CurrentIndexAndNode {
    fn new(current_index: usize, current_node: Arc<ServerNode>) -> Self {
        Self {
            current_index,
            current_node,
        }
    }
}

#[derive(thiserror::Error)]
pub enum NodeSelectorError {
    #[error("Empty database topology, this shouldn't happen.")]
    EmptyTopology,
}
impl std::fmt::Debug for NodeSelectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

/// Routing state derived from one [`Topology`].
#[derive(Debug)]
pub struct NodeSelectorState {
    topology: Arc<Topology>,
    failures: Vec<AtomicU32>,
    fastest_records: Vec<AtomicU32>,
    fastest: AtomicUsize,
    /// 0 = idle, 1 = entering a speed test, >1 = speed test running (value - 2 rounds recorded).
    speed_test_mode: AtomicUsize,
}

impl NodeSelectorState {
    fn new(topology: Arc<Topology>) -> Self {
        let len = topology.nodes.len();
        Self {
            topology,
            failures: (0..len).map(|_| AtomicU32::new(0)).collect(),
            fastest_records: (0..len).map(|_| AtomicU32::new(0)).collect(),
            fastest: AtomicUsize::new(0),
            speed_test_mode: AtomicUsize::new(0),
        }
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn nodes(&self) -> &[Arc<ServerNode>] {
        &self.topology.nodes
    }

    /// Failure count of the node at `index`, `None` when out of range.
    pub fn failures(&self, index: usize) -> Option<u32> {
        self.failures.get(index).map(|f| f.load(Ordering::Acquire))
    }

    pub fn fastest(&self) -> usize {
        self.fastest.load(Ordering::Acquire)
    }

    fn is_healthy(&self, index: usize) -> bool {
        self.failures(index) == Some(0)
    }

    fn is_healthy_member(&self, index: usize) -> bool {
        self.is_healthy(index) && self.nodes()[index].server_role == ServerRole::Member
    }

    fn node_at(&self, index: usize) -> CurrentIndexAndNode {
        CurrentIndexAndNode::new(index, self.nodes()[index].clone())
    }

    fn preferred_node(&self) -> Result<CurrentIndexAndNode, NodeSelectorError> {
        let len = self.nodes().len().min(self.failures.len());
        match (0..len).find(|&i| self.is_healthy(i)) {
            Some(index) => Ok(self.node_at(index)),
            None => self.unlikely_everyone_faulted_choice(),
        }
    }

    // Everything is marked as failed. Hand out the first node anyway so the caller gets the
    // real network error (or the node has recovered in the meantime).
    fn unlikely_everyone_faulted_choice(&self) -> Result<CurrentIndexAndNode, NodeSelectorError> {
        if self.nodes().is_empty() {
            return Err(NodeSelectorError::EmptyTopology);
        }
        tracing::debug!("All nodes are marked as failed, falling back to the first node");
        Ok(self.node_at(0))
    }

    fn switch_to_speed_test_phase(&self) {
        if self
            .speed_test_mode
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        for record in &self.fastest_records {
            record.store(0, Ordering::Release);
        }

        self.speed_test_mode.fetch_add(1, Ordering::AcqRel);
        tracing::debug!("Switched to speed test phase");
    }

    fn in_speed_test_phase(&self) -> bool {
        self.speed_test_mode.load(Ordering::Acquire) > 1
    }

    fn find_max_index(&self) -> usize {
        let mut max_index = 0;
        let mut max_value = 0;
        for (index, record) in self.fastest_records.iter().enumerate() {
            let value = record.load(Ordering::Acquire);
            if value > max_value {
                max_index = index;
                max_value = value;
            }
        }
        max_index
    }
}

/// Picks nodes from the current topology according to the read balance policies.
#[derive(Debug)]
pub struct NodeSelector {
    state: Arc<ArcSwap<NodeSelectorState>>,
    update_fastest_node_timer: Mutex<Option<JoinHandle<()>>>,
    fastest_node_reevaluation: Duration,
}

impl NodeSelector {
    pub fn new(topology: Topology, fastest_node_reevaluation: Duration) -> Self {
        Self {
            state: Arc::new(ArcSwap::from_pointee(NodeSelectorState::new(Arc::new(
                topology,
            )))),
            update_fastest_node_timer: Mutex::new(None),
            fastest_node_reevaluation,
        }
    }

    pub fn topology(&self) -> Arc<Topology> {
        self.state.load().topology.clone()
    }

    /// Snapshot of the current routing state.
    pub fn state(&self) -> Arc<NodeSelectorState> {
        self.state.load_full()
    }

    /// Adopts `topology` if its etag is newer than the current one, or unconditionally when
    /// `force_update` is set. All failure and speed-test counters start from zero.
    pub fn on_update_topology(&self, topology: Topology, force_update: bool) -> bool {
        let topology = Arc::new(topology);
        loop {
            let current = self.state.load_full();
            if !force_update && current.topology.etag >= topology.etag {
                tracing::trace!(
                    current_etag = current.topology.etag,
                    new_etag = topology.etag,
                    "Ignoring topology that is not newer than the current one"
                );
                return false;
            }

            let new_state = Arc::new(NodeSelectorState::new(topology.clone()));
            let previous = self.state.compare_and_swap(&current, new_state);
            if Arc::ptr_eq(&previous, &current) {
                tracing::debug!(etag = topology.etag, "Adopted new topology");
                return true;
            }
        }
    }

    /// First healthy node in topology order, or the first node when every node has failed.
    pub fn get_preferred_node(&self) -> Result<CurrentIndexAndNode, NodeSelectorError> {
        self.state.load().preferred_node()
    }

    /// Round-robin choice: the first healthy member at or after `session_id % node_count`,
    /// wrapping around, falling back to the preferred node.
    pub fn get_node_by_session_id(
        &self,
        session_id: i32,
    ) -> Result<CurrentIndexAndNode, NodeSelectorError> {
        let state = self.state.load();
        let count = state.nodes().len().min(state.failures.len());
        if count == 0 {
            return Err(NodeSelectorError::EmptyTopology);
        }

        let start = i64::from(session_id).rem_euclid(count as i64) as usize;
        match (start..count)
            .chain(0..start)
            .find(|&i| state.is_healthy_member(i))
        {
            Some(index) => Ok(state.node_at(index)),
            None => state.preferred_node(),
        }
    }

    /// The node that won the last speed test. When it is unhealthy a new speed test is started
    /// and the preferred node is used meanwhile.
    pub fn get_fastest_node(&self) -> Result<CurrentIndexAndNode, NodeSelectorError> {
        let state = self.state.load();
        if state.nodes().is_empty() {
            return Err(NodeSelectorError::EmptyTopology);
        }

        let fastest = state.fastest();
        if fastest < state.nodes().len() && state.is_healthy_member(fastest) {
            return Ok(state.node_at(fastest));
        }

        state.switch_to_speed_test_phase();
        state.preferred_node()
    }

    pub fn on_failed_request(&self, node_index: usize) {
        let state = self.state.load();
        // Out of range means the topology changed under us, nothing to record.
        if let Some(failures) = state.failures.get(node_index) {
            let count = failures.fetch_add(1, Ordering::AcqRel) + 1;
            tracing::debug!(node_index, failures = count, "Recorded failed request");
        }
    }

    pub fn restore_node_index(&self, node_index: usize) {
        let state = self.state.load();
        if let Some(failures) = state.failures.get(node_index) {
            failures.store(0, Ordering::Release);
            tracing::debug!(node_index, "Node restored");
        }
    }

    pub fn schedule_speed_test(&self) {
        self.state.load().switch_to_speed_test_phase();
    }

    pub fn in_speed_test_phase(&self) -> bool {
        self.state.load().in_speed_test_phase()
    }

    /// Records that `node`, found at `index`, answered a speed-test request first.
    ///
    /// The vote is dropped when the node at `index` is no longer the same instance, which
    /// happens when the topology was swapped while the request was in flight.
    pub fn record_fastest(&self, index: usize, node: &Arc<ServerNode>) {
        let state = self.state.load_full();
        let Some(record) = state.fastest_records.get(index) else {
            return;
        };
        if !Arc::ptr_eq(node, &state.nodes()[index]) {
            return;
        }

        if record.fetch_add(1, Ordering::AcqRel) + 1 >= FASTEST_NODE_WINS {
            self.select_fastest(&state, index);
            return;
        }

        let previous_mode = state.speed_test_mode.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |mode| (mode > 1).then_some(mode + 1),
        );
        let rounds = match previous_mode {
            Ok(mode) => mode - 1,
            Err(_) => return,
        };
        if rounds <= state.nodes().len() * SPEED_TEST_ROUNDS_PER_NODE {
            return;
        }

        // Too many concurrent speed tests are running, settle on the current leader.
        let max_index = state.find_max_index();
        self.select_fastest(&state, max_index);
    }

    fn select_fastest(&self, state: &NodeSelectorState, index: usize) {
        state.fastest.store(index, Ordering::Release);
        state.speed_test_mode.store(0, Ordering::Release);
        tracing::debug!(index, "Selected fastest node");

        self.arm_update_fastest_node_timer();
    }

    fn arm_update_fastest_node_timer(&self) {
        let mut timer = self.update_fastest_node_timer.lock();
        if let Some(previous) = timer.take() {
            previous.abort();
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                tracing::warn!("No tokio runtime available, fastest node will not be re-evaluated");
                return;
            }
        };

        let state = Arc::downgrade(&self.state);
        let period = self.fastest_node_reevaluation;
        *timer = Some(runtime.spawn(async move {
            tokio::time::sleep(period).await;
            if let Some(state) = state.upgrade() {
                state.load().switch_to_speed_test_phase();
            }
        }));
    }

    pub fn close(&self) {
        if let Some(timer) = self.update_fastest_node_timer.lock().take() {
            timer.abort();
        }
    }
}

impl Drop for NodeSelector {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use reqwest::Url;

    use super::*;

    fn member(port: u16) -> ServerNode {
        ServerNode::new(
            Url::parse(&format!("http://127.0.0.1:{}", port)).unwrap(),
            "db".to_string(),
        )
        .with_cluster_tag(&port.to_string())
        .with_server_role(ServerRole::Member)
    }

    fn topology(etag: i64, node_count: u16) -> Topology {
        Topology::new(etag, (0..node_count).map(|i| member(8080 + i)).collect())
    }

    fn selector(etag: i64, node_count: u16) -> NodeSelector {
        NodeSelector::new(topology(etag, node_count), Duration::from_secs(60))
    }

    #[test]
    fn on_update_topology_ignores_older_or_equal_etag() {
        let selector = selector(10, 2);

        assert!(!selector.on_update_topology(topology(10, 3), false));
        assert!(!selector.on_update_topology(topology(9, 3), false));

        assert_eq!(selector.topology().etag, 10);
        assert_eq!(selector.topology().nodes.len(), 2);
    }

    #[test]
    fn on_update_topology_adopts_newer_etag_and_resets_failures() {
        let selector = selector(1, 2);
        selector.on_failed_request(0);

        assert!(selector.on_update_topology(topology(2, 2), false));

        assert_eq!(selector.topology().etag, 2);
        assert_eq!(selector.state().failures(0), Some(0));
    }

    #[test]
    fn on_update_topology_with_force_replaces_older_etag() {
        let selector = selector(5, 2);

        assert!(selector.on_update_topology(topology(3, 1), true));

        assert_eq!(selector.topology().etag, 3);
        assert_eq!(selector.topology().nodes.len(), 1);
    }

    #[test]
    fn preferred_node_skips_failed_nodes() {
        for node_count in 1..=5u16 {
            let selector = selector(1, node_count);
            for i in 0..usize::from(node_count) - 1 {
                selector.on_failed_request(i);
            }

            let chosen = selector.get_preferred_node().unwrap();

            assert_eq!(chosen.current_index, usize::from(node_count) - 1);
        }
    }

    #[test]
    fn preferred_node_falls_back_to_first_node_when_everyone_failed() {
        for node_count in 1..=5u16 {
            let selector = selector(1, node_count);
            for i in 0..usize::from(node_count) {
                selector.on_failed_request(i);
            }

            let chosen = selector.get_preferred_node().unwrap();

            assert_eq!(chosen.current_index, 0);
        }
    }

    #[test]
    fn empty_topology_is_an_error() {
        let selector = selector(1, 0);

        assert!(matches!(
            selector.get_preferred_node(),
            Err(NodeSelectorError::EmptyTopology)
        ));
        assert!(selector.get_node_by_session_id(3).is_err());
        assert!(selector.get_fastest_node().is_err());
    }

    #[test]
    fn on_failed_request_out_of_range_is_ignored() {
        let selector = selector(1, 2);

        selector.on_failed_request(17);

        assert_eq!(selector.state().failures(0), Some(0));
        assert_eq!(selector.state().failures(1), Some(0));
    }

    #[test]
    fn restore_node_index_makes_node_preferred_again() {
        let selector = selector(1, 3);
        selector.on_failed_request(0);
        assert_eq!(selector.get_preferred_node().unwrap().current_index, 1);

        selector.restore_node_index(0);

        assert_eq!(selector.get_preferred_node().unwrap().current_index, 0);
    }

    #[test]
    fn node_by_session_id_is_deterministic() {
        let selector = selector(1, 3);

        let first = selector.get_node_by_session_id(7).unwrap();
        let second = selector.get_node_by_session_id(7).unwrap();

        assert_eq!(first.current_index, 1);
        assert_eq!(first.current_index, second.current_index);
        assert!(Arc::ptr_eq(&first.current_node, &second.current_node));
    }

    #[test]
    fn node_by_session_id_spreads_sessions_and_skips_failed_nodes() {
        let selector = selector(1, 3);

        let assigned = (0..3)
            .map(|session| selector.get_node_by_session_id(session).unwrap().current_index)
            .collect::<Vec<_>>();
        assert_eq!(assigned, vec![0, 1, 2]);

        selector.on_failed_request(1);

        assert_eq!(selector.get_node_by_session_id(1).unwrap().current_index, 2);
    }

    #[test]
    fn node_by_session_id_wraps_around_and_requires_members() {
        let nodes = vec![
            member(8080),
            member(8081).with_server_role(ServerRole::Promotable),
            member(8082),
        ];
        let selector = NodeSelector::new(Topology::new(1, nodes), Duration::from_secs(60));
        selector.on_failed_request(2);

        // Starts at 2 (failed), wraps to 0; index 1 is skipped because it is not a member.
        assert_eq!(selector.get_node_by_session_id(2).unwrap().current_index, 0);
        assert_eq!(selector.get_node_by_session_id(1).unwrap().current_index, 0);
    }

    #[test]
    fn node_by_session_id_accepts_negative_ids() {
        let selector = selector(1, 3);

        assert_eq!(selector.get_node_by_session_id(-1).unwrap().current_index, 2);
    }

    #[test]
    fn fastest_node_with_failures_starts_speed_test() {
        let selector = selector(1, 3);
        selector.on_failed_request(0);

        let chosen = selector.get_fastest_node().unwrap();

        assert_eq!(chosen.current_index, 1);
        assert!(selector.in_speed_test_phase());
    }

    #[tokio::test(start_paused = true)]
    async fn ten_wins_make_a_node_the_fastest_until_reevaluation() {
        let selector = selector(1, 3);
        selector.schedule_speed_test();
        assert!(selector.in_speed_test_phase());
        let node = selector.state().nodes()[2].clone();

        for _ in 0..FASTEST_NODE_WINS {
            selector.record_fastest(2, &node);
        }

        assert!(!selector.in_speed_test_phase());
        let chosen = selector.get_fastest_node().unwrap();
        assert_eq!(chosen.current_index, 2);
        assert!(!selector.in_speed_test_phase());

        tokio::time::sleep(Duration::from_secs(61)).await;

        assert!(selector.in_speed_test_phase());
    }

    #[test]
    fn record_fastest_discards_votes_for_stale_nodes() {
        let selector = selector(1, 2);
        let stale = selector.state().nodes()[1].clone();
        selector.on_update_topology(topology(2, 2), false);

        for _ in 0..FASTEST_NODE_WINS {
            selector.record_fastest(1, &stale);
        }
        selector.record_fastest(5, &stale);

        assert_eq!(selector.state().fastest(), 0);
    }

    #[tokio::test]
    async fn too_many_speed_test_rounds_force_a_decision() {
        let selector = selector(1, 2);
        selector.schedule_speed_test();
        let state = selector.state();
        let nodes = state.nodes().to_vec();
        for _ in 0..3 {
            selector.record_fastest(1, &nodes[1]);
        }
        selector.record_fastest(0, &nodes[0]);
        assert!(selector.in_speed_test_phase());

        // Pretend other callers already ran the allowed number of rounds.
        state
            .speed_test_mode
            .store(2 + 2 * SPEED_TEST_ROUNDS_PER_NODE, Ordering::Release);
        selector.record_fastest(0, &nodes[0]);

        assert!(!selector.in_speed_test_phase());
        assert_eq!(selector.state().fastest(), 1);
    }
}
