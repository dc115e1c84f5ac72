use std::sync::Arc;

use serde::Deserialize;

use crate::server_node::ServerNode;

/// A versioned list of database nodes.
///
/// Never mutated once built. Adopting a newer topology means building a new value and handing
/// it to [`NodeSelector::on_update_topology`](crate::node_selector::NodeSelector::on_update_topology).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Topology {
    #[serde(default)]
    pub etag: i64,
    #[serde(default)]
    pub nodes: Vec<Arc<ServerNode>>,
}

impl Topology {
    pub fn new(etag: i64, nodes: Vec<ServerNode>) -> Self {
        Self {
            etag,
            nodes: nodes.into_iter().map(Arc::new).collect(),
        }
    }
}
