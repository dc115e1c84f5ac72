use std::collections::HashMap;

use reqwest::Url;
use serde::Deserialize;

use crate::{
    server_node::{ServerNode, ServerRole},
    topology::Topology,
};

/// Response of the `/cluster/topology` endpoint. Only the fields the client routes on are kept.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct ClusterTopologyResponse {
    pub topology: ClusterTopology,
    pub etag: i64,
    pub leader: String,
    pub node_tag: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct ClusterTopology {
    pub topology_id: String,
    pub all_nodes: HashMap<String, Url>,
    pub members: HashMap<String, Url>,
    pub promotables: HashMap<String, Url>,
    pub watchers: HashMap<String, Url>,
    pub last_node_id: String,
    pub etag: i64,
}

impl ClusterTopologyResponse {
    /// Flattens the cluster view into a routable [`Topology`].
    ///
    /// Members come first, then promotables, then watchers, each group ordered by node tag so
    /// the result is stable between calls.
    pub fn into_topology(self) -> Topology {
        let mut nodes = Vec::new();
        let groups = [
            (self.topology.members, ServerRole::Member),
            (self.topology.promotables, ServerRole::Promotable),
            (self.topology.watchers, ServerRole::Watcher),
        ];
        for (group, role) in groups {
            let mut group = group.into_iter().collect::<Vec<_>>();
            group.sort_by(|a, b| a.0.cmp(&b.0));
            nodes.extend(group.into_iter().map(|(tag, url)| {
                ServerNode::new(url, String::new())
                    .with_cluster_tag(&tag)
                    .with_server_role(role)
            }));
        }

        let etag = if self.etag != 0 {
            self.etag
        } else {
            self.topology.etag
        };
        Topology::new(etag, nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn into_topology_orders_members_before_promotables_and_watchers() {
        let json = r#"{
            "Leader": "A",
            "NodeTag": "A",
            "Etag": 7,
            "Topology": {
                "TopologyId": "x",
                "Members": { "B": "http://b:8080", "A": "http://a:8080" },
                "Promotables": { "C": "http://c:8080" },
                "Watchers": { "D": "http://d:8080" }
            }
        }"#;
        let response: ClusterTopologyResponse = serde_json::from_str(json).unwrap();

        let topology = response.into_topology();

        let tags = topology
            .nodes
            .iter()
            .map(|n| n.cluster_tag.as_str())
            .collect::<Vec<_>>();
        assert_eq!(tags, vec!["A", "B", "C", "D"]);
        assert_eq!(topology.nodes[0].server_role, ServerRole::Member);
        assert_eq!(topology.nodes[2].server_role, ServerRole::Promotable);
        assert_eq!(topology.nodes[3].server_role, ServerRole::Watcher);
        assert_eq!(topology.etag, 7);
    }
}
