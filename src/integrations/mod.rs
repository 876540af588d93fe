//! External connectors: Docker and Nginx Proxy Manager
//!
//! Reads never fail outright. An unconfigured or unreachable connector
//! yields [`ConnectorData::Unavailable`] so an aggregate view still shows
//! what the other sources report.

pub mod docker;
pub mod npm;

use crate::audit::{AuditAction, ResourceType};
use crate::core::access::{Actor, Permission};
use crate::core::coordinator::{Intent, LockScope, MutationContext};
use crate::core::error::{Error, Result};
use crate::net::NetworkManager;
use crate::net::model::ListeningPort;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

pub use docker::{Container, DockerConnector, DockerNetwork};
pub use npm::{
    AccessList, Certificate, NpmClient, ProxyHost, ProxyHostCreate, RedirectionHost, Stream, StreamCreate,
};

const DOCKER_DISABLED: &str = "docker integration is disabled";
const NPM_UNCONFIGURED: &str = "Nginx Proxy Manager URL or credentials not configured";

/// Data from one connector, or why it could not be fetched
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ConnectorData<T> {
    Available { data: T },
    Unavailable { reason: String },
}

impl<T> ConnectorData<T> {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable { reason: reason.into() }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available { .. })
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            Self::Available { data } => Some(data),
            Self::Unavailable { .. } => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ConnectorData<U> {
        match self {
            Self::Available { data } => ConnectorData::Available { data: f(data) },
            Self::Unavailable { reason } => ConnectorData::Unavailable { reason },
        }
    }
}

impl<T> From<Result<T>> for ConnectorData<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(data) => Self::Available { data },
            Err(e) => {
                debug!(error = %e, "Connector unavailable");
                Self::unavailable(e.to_string())
            }
        }
    }
}

/// Every listening port the host exposes, by source
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Exposure {
    pub system: ConnectorData<Vec<ListeningPort>>,
    pub docker: ConnectorData<Vec<ListeningPort>>,
    pub proxy: ConnectorData<Vec<ListeningPort>>,
}

impl Exposure {
    /// Ports reachable from outside the host, across all available sources
    pub fn public_ports(&self) -> Vec<&ListeningPort> {
        [&self.system, &self.docker, &self.proxy]
            .into_iter()
            .filter_map(ConnectorData::data)
            .flatten()
            .filter(|p| p.is_public)
            .collect()
    }
}

pub struct Integrations {
    docker: Option<DockerConnector>,
    npm: Option<Arc<NpmClient>>,
    mutations: MutationContext,
}

impl Integrations {
    pub fn new(docker: Option<DockerConnector>, npm: Option<NpmClient>, mutations: MutationContext) -> Self {
        Self {
            docker,
            npm: npm.map(Arc::new),
            mutations,
        }
    }

    /// Docker server version
    pub async fn docker_status(&self) -> ConnectorData<String> {
        match &self.docker {
            Some(docker) => docker.version().await.into(),
            None => ConnectorData::unavailable(DOCKER_DISABLED),
        }
    }

    pub async fn docker_containers(&self) -> ConnectorData<Vec<Container>> {
        match &self.docker {
            Some(docker) => docker.containers().await.into(),
            None => ConnectorData::unavailable(DOCKER_DISABLED),
        }
    }

    pub async fn proxy_hosts(&self) -> ConnectorData<Vec<ProxyHost>> {
        match &self.npm {
            Some(npm) => npm.proxy_hosts().await.into(),
            None => ConnectorData::unavailable(NPM_UNCONFIGURED),
        }
    }

    pub async fn streams(&self) -> ConnectorData<Vec<Stream>> {
        match &self.npm {
            Some(npm) => npm.streams().await.into(),
            None => ConnectorData::unavailable(NPM_UNCONFIGURED),
        }
    }

    pub async fn docker_networks(&self) -> ConnectorData<Vec<DockerNetwork>> {
        match &self.docker {
            Some(docker) => docker.networks().await.into(),
            None => ConnectorData::unavailable(DOCKER_DISABLED),
        }
    }

    /// Unlike the listings this surfaces the failure, so a bad container
    /// name reads as an error rather than an unavailable connector.
    pub async fn container_logs(&self, container: &str, tail: u32) -> Result<String> {
        match &self.docker {
            Some(docker) => docker.logs(container, tail).await,
            None => Err(Error::BackendUnavailable {
                target: "docker".to_string(),
                reason: DOCKER_DISABLED.to_string(),
            }),
        }
    }

    pub async fn redirection_hosts(&self) -> ConnectorData<Vec<RedirectionHost>> {
        match &self.npm {
            Some(npm) => npm.redirection_hosts().await.into(),
            None => ConnectorData::unavailable(NPM_UNCONFIGURED),
        }
    }

    pub async fn certificates(&self) -> ConnectorData<Vec<Certificate>> {
        match &self.npm {
            Some(npm) => npm.certificates().await.into(),
            None => ConnectorData::unavailable(NPM_UNCONFIGURED),
        }
    }

    pub async fn access_lists(&self) -> ConnectorData<Vec<AccessList>> {
        match &self.npm {
            Some(npm) => npm.access_lists().await.into(),
            None => ConnectorData::unavailable(NPM_UNCONFIGURED),
        }
    }

    /// System sockets, published container ports and proxy streams. Each
    /// source degrades on its own.
    pub async fn exposure(&self, network: &NetworkManager) -> Exposure {
        let (system, interfaces, containers, streams) = tokio::join!(
            network.listening_ports(),
            network.interfaces(),
            self.docker_containers(),
            self.streams(),
        );
        let interfaces = interfaces.unwrap_or_default();
        Exposure {
            system: system.into(),
            docker: containers.map(|c| docker::exposed_ports(&c, &interfaces)),
            proxy: streams.map(|s| npm::stream_ports(&s)),
        }
    }

    fn proxy_client(npm: Option<&Arc<NpmClient>>) -> Result<Arc<NpmClient>> {
        npm.cloned().ok_or_else(|| Error::BackendUnavailable {
            target: "nginx-proxy-manager".to_string(),
            reason: NPM_UNCONFIGURED.to_string(),
        })
    }

    pub async fn create_proxy_host(&self, actor: &Actor, host: ProxyHostCreate) -> Result<ProxyHost> {
        let mut intent = Intent::new(AuditAction::Create, ResourceType::ProxyHost).with_requested(&host);
        if let Some(domain) = host.domain_names.first() {
            intent = intent.with_resource_id(domain.clone());
        }
        let npm = self.npm.clone();
        self.mutations
            .execute(actor, Permission::DockerWrite, LockScope::Proxy, intent, move || {
                let npm = npm.clone();
                let host = host.clone();
                async move {
                    host.validate()?;
                    let client = Self::proxy_client(npm.as_ref())?;
                    let created = client.create_proxy_host(&host).await?;
                    info!(id = created.id, domains = ?created.domain_names, "Created proxy host");
                    Ok(created)
                }
            })
            .await
    }

    pub async fn create_stream(&self, actor: &Actor, stream: StreamCreate) -> Result<Stream> {
        let intent = Intent::new(AuditAction::Create, ResourceType::Stream)
            .with_resource_id(stream.incoming_port.to_string())
            .with_requested(&stream);
        let npm = self.npm.clone();
        self.mutations
            .execute(actor, Permission::DockerWrite, LockScope::Proxy, intent, move || {
                let npm = npm.clone();
                let stream = stream.clone();
                async move {
                    stream.validate()?;
                    let created = Self::proxy_client(npm.as_ref())?.create_stream(&stream).await?;
                    info!(id = created.id, port = created.incoming_port, "Created proxy stream");
                    Ok(created)
                }
            })
            .await
    }

    /// Deletes a proxy host, returning it as it was.
    pub async fn delete_proxy_host(&self, actor: &Actor, id: u64) -> Result<ProxyHost> {
        let intent = Intent::new(AuditAction::Delete, ResourceType::ProxyHost).with_resource_id(id.to_string());
        let npm = self.npm.clone();
        self.mutations
            .execute(actor, Permission::DockerWrite, LockScope::Proxy, intent, move || {
                let npm = npm.clone();
                async move {
                    let removed = Self::proxy_client(npm.as_ref())?.delete_proxy_host(id).await?;
                    info!(id, "Deleted proxy host");
                    Ok(removed)
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{MemoryAuditLog, Outcome};
    use crate::config::NpmSettings;
    use crate::core::access::Role;
    use crate::core::backend::NativeTool;
    use crate::core::coordinator::{Coordinator, RetryPolicy};
    use crate::core::error::StatusCode;
    use crate::core::test_helpers::FakeRunner;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn mutations() -> (MutationContext, Arc<MemoryAuditLog>) {
        let audit = Arc::new(MemoryAuditLog::new());
        let coordinator = Arc::new(Coordinator::new(RetryPolicy {
            max_attempts: 2,
            base_backoff: Duration::from_millis(1),
        }));
        (MutationContext::new(coordinator, audit.clone()), audit)
    }

    fn npm(url: &str) -> NpmClient {
        NpmClient::new(NpmSettings {
            url: url.to_string(),
            email: "admin@example.com".to_string(),
            password: "changeme".to_string(),
            accept_invalid_certs: false,
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    fn admin() -> Actor {
        Actor::new("alice", Role::Admin)
    }

    #[tokio::test]
    async fn test_exposure_degrades_per_connector() {
        let runner = FakeRunner::new().with_tool("ss").with_tool("ip").with_tool("docker").into_arc();
        runner.ok(
            "ss -tulnp",
            "Netid State Recv-Q Send-Q Local Address:Port Peer Address:Port Process\n\
             tcp LISTEN 0 128 0.0.0.0:22 0.0.0.0:* users:((\"sshd\",pid=901,fd=3))\n\
             tcp LISTEN 0 128 127.0.0.1:5432 0.0.0.0:* users:((\"postgres\",pid=77,fd=5))\n",
        );
        runner.ok("ip -j addr show", "[]");
        runner.fail(
            "docker ps -aq",
            1,
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock.",
        );
        let (ctx, _) = mutations();
        let network = NetworkManager::new(runner.clone(), Duration::from_secs(5), ctx.clone());
        let docker = DockerConnector::new(NativeTool::new(runner, "docker", Duration::from_secs(5)));
        let integrations = Integrations::new(Some(docker), None, ctx);

        let exposure = integrations.exposure(&network).await;
        assert_eq!(exposure.system.data().map(Vec::len), Some(2));
        assert!(!exposure.docker.is_available());
        assert!(matches!(&exposure.proxy, ConnectorData::Unavailable { reason } if reason == NPM_UNCONFIGURED));
        let public = exposure.public_ports();
        assert_eq!(public.len(), 1);
        assert_eq!(public[0].port, 22);
    }

    #[tokio::test]
    async fn test_create_without_npm_is_audited_failure() {
        let (ctx, audit) = mutations();
        let integrations = Integrations::new(None, None, ctx);
        let err = integrations
            .create_proxy_host(&admin(), ProxyHostCreate::new("app.example.com", "10.0.0.5", 80))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BackendUnavailable);

        let events = audit.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].resource_id.as_deref(), Some("app.example.com"));
        assert!(matches!(events[0].outcome, Outcome::Failure { code: StatusCode::BackendUnavailable, .. }));
        assert!(events[0].after.is_some());
    }

    #[tokio::test]
    async fn test_operator_cannot_change_proxy() {
        let (ctx, audit) = mutations();
        let integrations = Integrations::new(None, None, ctx);
        let operator = Actor::new("olga", Role::Operator);
        let err = integrations.delete_proxy_host(&operator, 3).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden { .. }));
        assert_eq!(audit.events().len(), 1);
    }

    #[tokio::test]
    async fn test_create_and_delete_proxy_host_audited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/tokens"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "t1"})))
            .mount(&server)
            .await;
        let host = json!({
            "id": 12, "domain_names": ["app.example.com"], "forward_host": "10.0.0.5",
            "forward_port": 80, "forward_scheme": "http", "enabled": true
        });
        Mock::given(method("POST"))
            .and(path("/api/nginx/proxy-hosts"))
            .respond_with(ResponseTemplate::new(201).set_body_json(host.clone()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/nginx/proxy-hosts/12"))
            .respond_with(ResponseTemplate::new(200).set_body_json(host))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/nginx/proxy-hosts/12"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(true)))
            .mount(&server)
            .await;

        let (ctx, audit) = mutations();
        let integrations = Integrations::new(None, Some(npm(&server.uri())), ctx);
        let created = integrations
            .create_proxy_host(&admin(), ProxyHostCreate::new("app.example.com", "10.0.0.5", 80))
            .await
            .unwrap();
        assert_eq!(created.id, 12);
        integrations.delete_proxy_host(&admin(), 12).await.unwrap();

        let events = audit.events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.outcome.is_success()));
        assert!(events.iter().all(|e| e.resource_id.as_deref() == Some("12")));
        let delete = events.iter().find(|e| e.action == AuditAction::Delete).unwrap();
        assert!(delete.before.is_some());
    }

    #[tokio::test]
    async fn test_create_stream_audited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/tokens"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "t1"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/nginx/streams"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": 5, "incoming_port": 5432, "forwarding_host": "db", "forwarding_port": 5432,
                "tcp_forwarding": 1, "udp_forwarding": 0, "enabled": 1
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (ctx, audit) = mutations();
        let integrations = Integrations::new(None, Some(npm(&server.uri())), ctx);
        let created = integrations
            .create_stream(&admin(), StreamCreate::new(5432, "db", 5432))
            .await
            .unwrap();
        assert_eq!(created.id, 5);

        let invalid = integrations
            .create_stream(&admin(), StreamCreate::new(5433, "", 5432))
            .await
            .unwrap_err();
        assert!(matches!(invalid, Error::InvalidRule(_)));

        let events = audit.events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.resource_type == ResourceType::Stream));
        assert_eq!(events[0].resource_id.as_deref(), Some("5"));
        assert!(events[0].outcome.is_success());
        assert!(!events[1].outcome.is_success());
    }

    #[tokio::test]
    async fn test_container_logs_need_docker() {
        let (ctx, _) = mutations();
        let integrations = Integrations::new(None, None, ctx);
        let err = integrations.container_logs("web", 10).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BackendUnavailable);
        assert!(!integrations.docker_networks().await.is_available());
        assert!(!integrations.certificates().await.is_available());
    }

    #[tokio::test]
    async fn test_reads_without_connectors() {
        let (ctx, _) = mutations();
        let integrations = Integrations::new(None, None, ctx);
        assert!(!integrations.proxy_hosts().await.is_available());
        assert!(!integrations.docker_containers().await.is_available());
        let json = serde_json::to_value(integrations.streams().await).unwrap();
        assert_eq!(json["status"], "unavailable");
    }
}
