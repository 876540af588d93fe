//! Service facade wiring configuration, runner, audit log and managers
//!
//! Every read checks the caller's read permission here; writes are checked
//! (and audited) by the managers themselves.

use crate::audit::{AuditEvent, AuditQuery, AuditSink, AuditSummary, JsonlAuditLog};
use crate::command::{CommandRunner, SystemRunner};
use crate::config::AppConfig;
use crate::core::access::{Actor, Permission};
use crate::core::backend::NativeTool;
use crate::core::coordinator::{Coordinator, MutationContext};
use crate::core::error::{Error, Result};
use crate::core::firewall::{BackendKind, BackendStatus, Detection, FirewallRule, NativeObjects, Protocol};
use crate::core::manager::FirewallManager;
use crate::integrations::{
    AccessList, Certificate, ConnectorData, Container, DockerConnector, DockerNetwork, Exposure, Integrations,
    NpmClient, ProxyHost, ProxyHostCreate, RedirectionHost, Stream, StreamCreate,
};
use crate::net::{ArpEntry, InterfacePorts, IpPolicyRule, ListeningPort, NetworkInterface, NetworkManager, Route};
use std::sync::Arc;
use tracing::{debug, info};

pub struct Unifw {
    firewall: FirewallManager,
    network: NetworkManager,
    integrations: Integrations,
    audit: Arc<dyn AuditSink>,
}

impl Unifw {
    /// Builds the service against the real host.
    ///
    /// # Errors
    ///
    /// `Internal` when no audit log location can be determined or the HTTP
    /// client cannot be built.
    pub fn new(config: &AppConfig) -> Result<Self> {
        let path = config
            .audit_log_path()
            .ok_or_else(|| Error::Internal("cannot determine a location for the audit log".to_string()))?;
        info!(audit = %path.display(), "Starting unifw service");
        Self::with_runner(config, Arc::new(SystemRunner), Arc::new(JsonlAuditLog::new(path)))
    }

    pub fn with_runner(config: &AppConfig, runner: Arc<dyn CommandRunner>, audit: Arc<dyn AuditSink>) -> Result<Self> {
        let coordinator = Arc::new(Coordinator::new(config.retry_policy()));
        let mutations = MutationContext::new(coordinator, audit.clone());
        let timeout = config.command_timeout();

        let docker = config
            .docker_enabled
            .then(|| DockerConnector::new(NativeTool::new(runner.clone(), "docker", timeout)));
        let npm = config.npm_settings().map(NpmClient::new).transpose()?;
        debug!(docker = docker.is_some(), npm = npm.is_some(), "Connectors configured");

        Ok(Self {
            firewall: FirewallManager::new(runner.clone(), &config.backend_options(), mutations.clone()),
            network: NetworkManager::new(runner, timeout, mutations.clone()),
            integrations: Integrations::new(docker, npm, mutations),
            audit,
        })
    }

    pub fn firewall(&self) -> &FirewallManager {
        &self.firewall
    }

    pub fn network(&self) -> &NetworkManager {
        &self.network
    }

    pub fn integrations(&self) -> &Integrations {
        &self.integrations
    }

    // Firewall

    pub async fn backends(&self, actor: &Actor, refresh: bool) -> Result<Detection> {
        actor.require(Permission::FirewallRead)?;
        Ok(if refresh {
            self.firewall.refresh().await
        } else {
            self.firewall.detect().await
        })
    }

    pub async fn status(&self, actor: &Actor, choice: Option<BackendKind>) -> Result<BackendStatus> {
        actor.require(Permission::FirewallRead)?;
        self.firewall.status(choice).await
    }

    pub async fn list_rules(&self, actor: &Actor, choice: Option<BackendKind>) -> Result<Vec<FirewallRule>> {
        actor.require(Permission::FirewallRead)?;
        self.firewall.list_rules(choice).await
    }

    /// ufw application profiles, firewalld zones and services, or nftables
    /// tables and chains.
    pub async fn native_objects(&self, actor: &Actor, choice: Option<BackendKind>) -> Result<NativeObjects> {
        actor.require(Permission::FirewallRead)?;
        self.firewall.native_objects(choice).await
    }

    pub async fn add_rule(&self, actor: &Actor, choice: Option<BackendKind>, rule: FirewallRule) -> Result<FirewallRule> {
        self.firewall.add_rule(actor, choice, rule).await
    }

    pub async fn block_port(
        &self,
        actor: &Actor,
        choice: Option<BackendKind>,
        port: u16,
        protocol: Protocol,
        interface: Option<String>,
    ) -> Result<FirewallRule> {
        self.firewall.block_port(actor, choice, port, protocol, interface).await
    }

    pub async fn delete_rule(&self, actor: &Actor, choice: Option<BackendKind>, id: &str) -> Result<FirewallRule> {
        self.firewall.delete_rule(actor, choice, id).await
    }

    pub async fn enable(&self, actor: &Actor, choice: Option<BackendKind>) -> Result<BackendStatus> {
        self.firewall.enable(actor, choice).await
    }

    pub async fn disable(&self, actor: &Actor, choice: Option<BackendKind>) -> Result<BackendStatus> {
        self.firewall.disable(actor, choice).await
    }

    // Routing

    pub async fn interfaces(&self, actor: &Actor) -> Result<Vec<NetworkInterface>> {
        actor.require(Permission::RoutesRead)?;
        self.network.interfaces().await
    }

    pub async fn routes(&self, actor: &Actor) -> Result<Vec<Route>> {
        actor.require(Permission::RoutesRead)?;
        self.network.routes().await
    }

    pub async fn add_route(&self, actor: &Actor, route: Route) -> Result<Route> {
        self.network.add_route(actor, route).await
    }

    pub async fn delete_route(&self, actor: &Actor, route: Route) -> Result<Route> {
        self.network.delete_route(actor, route).await
    }

    pub async fn ip_rules(&self, actor: &Actor) -> Result<Vec<IpPolicyRule>> {
        actor.require(Permission::RoutesRead)?;
        self.network.ip_rules().await
    }

    pub async fn add_ip_rule(&self, actor: &Actor, rule: IpPolicyRule) -> Result<IpPolicyRule> {
        self.network.add_ip_rule(actor, rule).await
    }

    pub async fn delete_ip_rule(&self, actor: &Actor, priority: u32) -> Result<IpPolicyRule> {
        self.network.delete_ip_rule(actor, priority).await
    }

    pub async fn arp_table(&self, actor: &Actor) -> Result<Vec<ArpEntry>> {
        actor.require(Permission::RoutesRead)?;
        self.network.arp_table().await
    }

    // Ports

    pub async fn listening_ports(&self, actor: &Actor) -> Result<Vec<ListeningPort>> {
        actor.require(Permission::PortsRead)?;
        self.network.listening_ports().await
    }

    pub async fn ports_by_interface(&self, actor: &Actor) -> Result<Vec<InterfacePorts>> {
        actor.require(Permission::PortsRead)?;
        self.network.ports_by_interface().await
    }

    pub async fn exposure(&self, actor: &Actor) -> Result<Exposure> {
        actor.require(Permission::PortsRead)?;
        Ok(self.integrations.exposure(&self.network).await)
    }

    // Integrations

    pub async fn docker_containers(&self, actor: &Actor) -> Result<ConnectorData<Vec<Container>>> {
        actor.require(Permission::DockerRead)?;
        Ok(self.integrations.docker_containers().await)
    }

    pub async fn docker_networks(&self, actor: &Actor) -> Result<ConnectorData<Vec<DockerNetwork>>> {
        actor.require(Permission::DockerRead)?;
        Ok(self.integrations.docker_networks().await)
    }

    pub async fn container_logs(&self, actor: &Actor, container: &str, tail: u32) -> Result<String> {
        actor.require(Permission::DockerRead)?;
        self.integrations.container_logs(container, tail).await
    }

    pub async fn proxy_hosts(&self, actor: &Actor) -> Result<ConnectorData<Vec<ProxyHost>>> {
        actor.require(Permission::DockerRead)?;
        Ok(self.integrations.proxy_hosts().await)
    }

    pub async fn streams(&self, actor: &Actor) -> Result<ConnectorData<Vec<Stream>>> {
        actor.require(Permission::DockerRead)?;
        Ok(self.integrations.streams().await)
    }

    pub async fn redirection_hosts(&self, actor: &Actor) -> Result<ConnectorData<Vec<RedirectionHost>>> {
        actor.require(Permission::DockerRead)?;
        Ok(self.integrations.redirection_hosts().await)
    }

    pub async fn certificates(&self, actor: &Actor) -> Result<ConnectorData<Vec<Certificate>>> {
        actor.require(Permission::DockerRead)?;
        Ok(self.integrations.certificates().await)
    }

    pub async fn access_lists(&self, actor: &Actor) -> Result<ConnectorData<Vec<AccessList>>> {
        actor.require(Permission::DockerRead)?;
        Ok(self.integrations.access_lists().await)
    }

    pub async fn create_stream(&self, actor: &Actor, stream: StreamCreate) -> Result<Stream> {
        self.integrations.create_stream(actor, stream).await
    }

    pub async fn create_proxy_host(&self, actor: &Actor, host: ProxyHostCreate) -> Result<ProxyHost> {
        self.integrations.create_proxy_host(actor, host).await
    }

    pub async fn delete_proxy_host(&self, actor: &Actor, id: u64) -> Result<ProxyHost> {
        self.integrations.delete_proxy_host(actor, id).await
    }

    // Audit

    pub async fn audit_events(&self, actor: &Actor, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        actor.require(Permission::AuditRead)?;
        Ok(self.audit.query(query).await?)
    }

    /// Counts over the events `query` selects, ignoring its limit
    pub async fn audit_summary(&self, actor: &Actor, query: &AuditQuery) -> Result<AuditSummary> {
        actor.require(Permission::AuditRead)?;
        let query = AuditQuery {
            limit: None,
            ..query.clone()
        };
        Ok(AuditSummary::from_events(&self.audit.query(&query).await?))
    }
}
