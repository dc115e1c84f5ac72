use std::time::Duration;

/// How read requests are spread across the nodes of the topology.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub enum ReadBalanceBehavior {
    /// Reads go to the preferred node, like writes.
    #[default]
    None,
    /// Reads are pinned per session id, spreading sessions across members.
    RoundRobin,
    /// Reads go to whichever node answers fastest in periodic speed tests.
    FastestNode,
}

#[derive(Debug, Clone)]
pub struct DocumentConventions {
    disable_topology_updates: bool,
    read_balance_behavior: ReadBalanceBehavior,
    max_http_cache_size: usize,
    request_timeout: Duration,
    topology_update_interval: Duration,
    fastest_node_reevaluation: Duration,
    changes_reconnect_delay: Duration,
    speed_test_timeout: Duration,
}

impl Default for DocumentConventions {
    fn default() -> Self {
        Self {
            disable_topology_updates: false,
            read_balance_behavior: ReadBalanceBehavior::default(),
            max_http_cache_size: 128 * 1024 * 1024,
            request_timeout: Duration::from_secs(30),
            topology_update_interval: Duration::from_secs(60),
            fastest_node_reevaluation: Duration::from_secs(60),
            changes_reconnect_delay: Duration::from_secs(1),
            speed_test_timeout: Duration::from_secs(15),
        }
    }
}

// Mutators
impl DocumentConventions {
    pub fn default_for_single_server() -> Self {
        Self {
            disable_topology_updates: true,
            ..Default::default()
        }
    }

    pub fn with_disable_topology_updates(mut self, disable: bool) -> Self {
        self.disable_topology_updates = disable;
        self
    }

    pub fn with_read_balance_behavior(mut self, behavior: ReadBalanceBehavior) -> Self {
        self.read_balance_behavior = behavior;
        self
    }

    pub fn with_max_http_cache_size(mut self, bytes: usize) -> Self {
        self.max_http_cache_size = bytes;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_topology_update_interval(mut self, interval: Duration) -> Self {
        self.topology_update_interval = interval;
        self
    }

    pub fn with_fastest_node_reevaluation(mut self, interval: Duration) -> Self {
        self.fastest_node_reevaluation = interval;
        self
    }

    pub fn with_changes_reconnect_delay(mut self, delay: Duration) -> Self {
        self.changes_reconnect_delay = delay;
        self
    }

    pub fn with_speed_test_timeout(mut self, timeout: Duration) -> Self {
        self.speed_test_timeout = timeout;
        self
    }
}

// Getters
impl DocumentConventions {
    pub fn disable_topology_updates(&self) -> bool {
        self.disable_topology_updates
    }

    pub fn read_balance_behavior(&self) -> ReadBalanceBehavior {
        self.read_balance_behavior
    }

    pub fn max_http_cache_size(&self) -> usize {
        self.max_http_cache_size
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn topology_update_interval(&self) -> Duration {
        self.topology_update_interval
    }

    pub fn fastest_node_reevaluation(&self) -> Duration {
        self.fastest_node_reevaluation
    }

    pub fn changes_reconnect_delay(&self) -> Duration {
        self.changes_reconnect_delay
    }

    pub fn speed_test_timeout(&self) -> Duration {
        self.speed_test_timeout
    }
}
