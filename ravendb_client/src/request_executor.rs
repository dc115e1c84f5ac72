mod request_executor_actor;
mod request_executor_error;
mod request_executor_handle;

use std::{collections::HashMap, net::IpAddr, sync::Arc};

pub use request_executor_actor::RequestExecutorActor;
pub use request_executor_error::RequestExecutorError;
pub use request_executor_handle::RequestExecutor;
use tokio::sync::oneshot;

use crate::server_node::ServerNode;

pub type DnsOverrides = HashMap<String, IpAddr>;

/// Settings of the `reqwest::Client` owned by each executor.
#[derive(Debug, Clone, Default)]
pub struct RequestExecutorOptions {
    pub client_identity: Option<reqwest::Identity>,
    pub dns_overrides: Option<DnsOverrides>,
    pub proxy_address: Option<String>,
}

#[derive(Debug)]
pub(crate) enum RequestExecutorMessage {
    UpdateTopology {
        node: Arc<ServerNode>,
        force_update: bool,
        respond_to: Option<oneshot::Sender<Result<bool, RequestExecutorError>>>,
    },
    NodeFailed {
        node_index: usize,
        node: Arc<ServerNode>,
    },
    Close {
        respond_to: oneshot::Sender<()>,
    },
}
