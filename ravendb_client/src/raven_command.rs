//! The raven commands are the only way to directly interact with the server.
//!
//! A command knows how to build its [`reqwest::Request`] for a given node and how to read the
//! response body. Everything else (node choice, retries, caching, headers the cluster protocol
//! needs) belongs to the [`RequestExecutor`](crate::request_executor::RequestExecutor).
use std::time::Duration;

use anyhow::Context;
use reqwest::{Method, Url};
use uuid::Uuid;

use crate::{
    cluster_topology::ClusterTopologyResponse, server_node::ServerNode, topology::Topology,
};

/// What a command expects in the response body.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ResponseType {
    /// The body is ignored.
    Empty,
    /// The body is a JSON document handed to [`RavenCommand::set_response`].
    Object,
}

pub trait RavenCommand: Send {
    /// Builds the request for `node`. The executor adds its own headers afterwards.
    fn create_request(
        &self,
        client: &reqwest::Client,
        node: &ServerNode,
    ) -> anyhow::Result<reqwest::Request>;

    /// Receives the response body, `None` for 404 responses and empty bodies.
    fn set_response(&mut self, response: Option<&str>, from_cache: bool) -> anyhow::Result<()>;

    /// Read requests are subject to the read balance behavior, everything else goes to the
    /// preferred node.
    fn is_read_request(&self) -> bool {
        false
    }

    fn response_type(&self) -> ResponseType {
        ResponseType::Object
    }

    fn can_cache(&self) -> bool {
        true
    }

    /// Whether a cached response may be returned without asking the server while aggressive
    /// caching is on. Commands that need fresh results opt out.
    fn can_cache_aggressively(&self) -> bool {
        true
    }

    /// Overrides the conventions' request timeout for this command.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Cache key of `request`. Only `GET` requests are cached by default.
    fn fingerprint(&self, request: &reqwest::Request) -> Option<String> {
        (request.method() == Method::GET).then(|| format!("{} {}", request.method(), request.url()))
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(
    response: Option<&str>,
    what: &str,
) -> anyhow::Result<T> {
    let body = response.with_context(|| format!("Server returned an empty {} response", what))?;
    serde_json::from_str(body).with_context(|| format!("Unable to deserialize {}", what))
}

/// Fetches the database topology from a node.
#[derive(Debug, Default)]
pub struct GetDatabaseTopologyCommand {
    application_id: Option<Uuid>,
    debug_tag: Option<String>,
    result: Option<Topology>,
}

impl GetDatabaseTopologyCommand {
    pub fn new(application_id: Option<Uuid>, debug_tag: Option<&str>) -> Self {
        Self {
            application_id,
            debug_tag: debug_tag.map(str::to_string),
            result: None,
        }
    }

    pub fn result(&self) -> Option<&Topology> {
        self.result.as_ref()
    }

    pub fn into_result(self) -> Option<Topology> {
        self.result
    }
}

impl RavenCommand for GetDatabaseTopologyCommand {
    fn create_request(
        &self,
        client: &reqwest::Client,
        node: &ServerNode,
    ) -> anyhow::Result<reqwest::Request> {
        let mut params = vec![("name", node.database.clone())];
        if let Some(debug_tag) = &self.debug_tag {
            params.push(("debugTag", debug_tag.clone()));
        }
        if let Some(application_id) = self.application_id {
            params.push(("applicationIdentifier", application_id.to_string()));
        }
        let url = Url::parse_with_params(&format!("{}/topology", node.base_url()), &params)?;

        Ok(client.request(Method::GET, url).build()?)
    }

    fn set_response(&mut self, response: Option<&str>, _from_cache: bool) -> anyhow::Result<()> {
        self.result = Some(parse_json(response, "database topology")?);
        Ok(())
    }

    fn is_read_request(&self) -> bool {
        true
    }

    fn can_cache(&self) -> bool {
        false
    }
}

/// Fetches the cluster topology, used by cluster-level executors.
#[derive(Debug, Default)]
pub struct GetClusterTopologyCommand {
    debug_tag: Option<String>,
    result: Option<ClusterTopologyResponse>,
}

impl GetClusterTopologyCommand {
    pub fn new(debug_tag: Option<&str>) -> Self {
        Self {
            debug_tag: debug_tag.map(str::to_string),
            result: None,
        }
    }

    pub fn result(&self) -> Option<&ClusterTopologyResponse> {
        self.result.as_ref()
    }

    pub fn into_result(self) -> Option<ClusterTopologyResponse> {
        self.result
    }
}

impl RavenCommand for GetClusterTopologyCommand {
    fn create_request(
        &self,
        client: &reqwest::Client,
        node: &ServerNode,
    ) -> anyhow::Result<reqwest::Request> {
        let mut url = Url::parse(&format!("{}/cluster/topology", node.base_url()))?;
        if let Some(debug_tag) = &self.debug_tag {
            url.query_pairs_mut().append_pair("debugTag", debug_tag);
        }

        Ok(client.request(Method::GET, url).build()?)
    }

    fn set_response(&mut self, response: Option<&str>, _from_cache: bool) -> anyhow::Result<()> {
        self.result = Some(parse_json(response, "cluster topology")?);
        Ok(())
    }

    fn is_read_request(&self) -> bool {
        true
    }

    fn can_cache(&self) -> bool {
        false
    }
}

/// Checks whether a node that was marked as failed answers again.
#[derive(Debug, Default)]
pub struct HealthCheckCommand {
    cluster: bool,
}

impl HealthCheckCommand {
    pub fn for_database() -> Self {
        Self { cluster: false }
    }

    pub fn for_cluster() -> Self {
        Self { cluster: true }
    }
}

impl RavenCommand for HealthCheckCommand {
    fn create_request(
        &self,
        client: &reqwest::Client,
        node: &ServerNode,
    ) -> anyhow::Result<reqwest::Request> {
        let url = if self.cluster {
            format!("{}/info/tcp?tag=health-check", node.base_url())
        } else {
            format!(
                "{}/databases/{}/stats?failure=check",
                node.base_url(),
                node.database
            )
        };

        Ok(client.request(Method::GET, Url::parse(&url)?).build()?)
    }

    fn set_response(&mut self, _response: Option<&str>, _from_cache: bool) -> anyhow::Result<()> {
        Ok(())
    }

    fn is_read_request(&self) -> bool {
        true
    }

    fn response_type(&self) -> ResponseType {
        ResponseType::Empty
    }

    fn can_cache(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> ServerNode {
        ServerNode::new(
            Url::parse("http://a.example.com:8080/").unwrap(),
            "North wind".to_string(),
        )
    }

    #[test]
    fn database_topology_request_targets_topology_endpoint() {
        let id = Uuid::new_v4();
        let command = GetDatabaseTopologyCommand::new(Some(id), None);

        let request = command
            .create_request(&reqwest::Client::new(), &node())
            .unwrap();

        assert_eq!(request.method(), Method::GET);
        assert_eq!(request.url().path(), "/topology");
        let query = request.url().query_pairs().collect::<Vec<_>>();
        assert!(query.contains(&("name".into(), "North wind".into())));
        assert!(query.contains(&("applicationIdentifier".into(), id.to_string().into())));
    }

    #[test]
    fn database_topology_set_response_parses_topology() {
        let mut command = GetDatabaseTopologyCommand::default();

        command
            .set_response(
                Some(r#"{"Etag": 3, "Nodes": [{"Url": "http://a:8080", "ClusterTag": "A"}]}"#),
                false,
            )
            .unwrap();

        let topology = command.into_result().unwrap();
        assert_eq!(topology.etag, 3);
        assert_eq!(topology.nodes[0].cluster_tag, "A");
    }

    #[test]
    fn database_topology_set_response_rejects_empty_body() {
        let mut command = GetDatabaseTopologyCommand::default();

        assert!(command.set_response(None, false).is_err());
    }

    #[test]
    fn health_check_request_depends_on_executor_kind() {
        let client = reqwest::Client::new();

        let database = HealthCheckCommand::for_database()
            .create_request(&client, &node())
            .unwrap();
        let cluster = HealthCheckCommand::for_cluster()
            .create_request(&client, &node())
            .unwrap();

        assert_eq!(database.url().path(), "/databases/North%20wind/stats");
        assert_eq!(database.url().query(), Some("failure=check"));
        assert_eq!(cluster.url().path(), "/info/tcp");
    }

    #[test]
    fn default_fingerprint_only_covers_get_requests() {
        let client = reqwest::Client::new();
        let command = HealthCheckCommand::for_database();
        let get = client.get("http://a:8080/docs?id=1").build().unwrap();
        let post = client.post("http://a:8080/docs?id=1").build().unwrap();

        assert_eq!(
            command.fingerprint(&get).as_deref(),
            Some("GET http://a:8080/docs?id=1")
        );
        assert!(command.fingerprint(&post).is_none());
    }
}
