use reqwest::Url;
use serde::Deserialize;

/// A single database node of the cluster as reported by the topology endpoint.
///
/// Identity is `url` + `database`. Selector code that has to detect a topology swap compares
/// nodes by `Arc` pointer instead, since two topologies can list equal nodes.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerNode {
    pub url: Url,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub cluster_tag: String,
    #[serde(default)]
    pub server_role: ServerRole,
}

impl ServerNode {
    pub fn new(url: Url, database: String) -> Self {
        Self {
            url,
            database,
            cluster_tag: String::default(),
            server_role: ServerRole::default(),
        }
    }

    pub fn with_cluster_tag(mut self, cluster_tag: &str) -> Self {
        self.cluster_tag = cluster_tag.to_string();
        self
    }

    pub fn with_server_role(mut self, server_role: ServerRole) -> Self {
        self.server_role = server_role;
        self
    }

    /// Base url of the node without a trailing slash, ready for path concatenation.
    pub fn base_url(&self) -> &str {
        self.url.as_str().trim_end_matches('/')
    }
}

#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Hash, Deserialize)]
pub enum ServerRole {
    Promotable,
    Member,
    Rehab,
    Watcher,
    /// Also stands in for roles this client does not know about.
    #[default]
    #[serde(other)]
    None,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_node_deserializes_from_topology_json() {
        let json = r#"{
            "Url": "http://a.example.com:8080",
            "ClusterTag": "A",
            "Database": "Northwind",
            "ServerRole": "Member"
        }"#;

        let node: ServerNode = serde_json::from_str(json).unwrap();

        assert_eq!(node.url.as_str(), "http://a.example.com:8080/");
        assert_eq!(node.cluster_tag, "A");
        assert_eq!(node.database, "Northwind");
        assert_eq!(node.server_role, ServerRole::Member);
    }

    #[test]
    fn unknown_server_role_falls_back_to_none() {
        let json = r#"{ "Url": "http://a:8080", "ServerRole": "Foo" }"#;

        let node: ServerNode = serde_json::from_str(json).unwrap();

        assert_eq!(node.server_role, ServerRole::None);
        assert_eq!(
            serde_json::from_str::<ServerRole>(r#""Watcher""#).unwrap(),
            ServerRole::Watcher
        );
    }

    #[test]
    fn missing_server_role_defaults_to_none() {
        let node: ServerNode = serde_json::from_str(r#"{ "Url": "http://a:8080" }"#).unwrap();

        assert_eq!(node.server_role, ServerRole::None);
        assert!(node.database.is_empty());
    }

    #[test]
    fn base_url_has_no_trailing_slash() {
        let node = ServerNode::new(Url::parse("http://a:8080").unwrap(), "db".to_string());
        assert_eq!(node.base_url(), "http://a:8080");
    }
}
