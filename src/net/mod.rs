//! Network introspection and routing changes
//!
//! Reads come straight from iproute2 and `ss` on every call. Route and
//! policy-rule changes go through the routing lock and are audited like
//! firewall mutations.

pub mod iproute;
pub mod model;
pub mod sockets;

use crate::audit::{AuditAction, ResourceType};
use crate::command::{CommandRunner, argv};
use crate::core::access::{Actor, Permission};
use crate::core::backend::NativeTool;
use crate::core::coordinator::{Intent, LockScope, MutationContext};
use crate::core::error::{Error, Result};
use network_interface::{Addr, NetworkInterfaceConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub use model::{
    ArpEntry, InterfaceAddress, InterfacePorts, IpPolicyRule, ListeningPort, NetworkInterface, Route,
};

const ROUTES: [&str; 5] = ["-j", "route", "show", "table", "all"];
const RULES: [&str; 3] = ["-j", "rule", "show"];

pub struct NetworkManager {
    ip: NativeTool,
    ss: NativeTool,
    mutations: MutationContext,
}

impl NetworkManager {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration, mutations: MutationContext) -> Self {
        Self {
            ip: NativeTool::new(runner.clone(), "ip", timeout),
            ss: NativeTool::new(runner, "ss", timeout),
            mutations,
        }
    }

    /// Interfaces from `ip -j addr show`, or from the OS enumeration when
    /// iproute2 is not installed.
    pub async fn interfaces(&self) -> Result<Vec<NetworkInterface>> {
        if !self.ip.is_installed() {
            warn!("ip not found, falling back to OS interface enumeration");
            return os_interfaces();
        }
        iproute::parse_addr(&self.ip.query(&["-j", "addr", "show"]).await?)
    }

    pub async fn routes(&self) -> Result<Vec<Route>> {
        iproute::parse_routes(&self.ip.query(&ROUTES).await?)
    }

    pub async fn ip_rules(&self) -> Result<Vec<IpPolicyRule>> {
        iproute::parse_rules(&self.ip.query(&RULES).await?)
    }

    pub async fn arp_table(&self) -> Result<Vec<ArpEntry>> {
        iproute::parse_neigh(&self.ip.query(&["-j", "neigh", "show"]).await?)
    }

    /// Bound TCP/UDP sockets with interface and exposure attached
    pub async fn listening_ports(&self) -> Result<Vec<ListeningPort>> {
        let out = self.ss.query(&["-tulnp"]).await?;
        let interfaces = self.interfaces().await.unwrap_or_else(|e| {
            warn!(error = %e, "Interface listing failed, ports will show as unknown");
            Vec::new()
        });
        Ok(sockets::join(sockets::parse_ss(&out), &interfaces))
    }

    pub async fn ports_by_interface(&self) -> Result<Vec<InterfacePorts>> {
        Ok(sockets::group_by_interface(self.listening_ports().await?))
    }

    /// Adds `route`, returning it as the kernel now lists it.
    pub async fn add_route(&self, actor: &Actor, route: Route) -> Result<Route> {
        let intent = Intent::new(AuditAction::Create, ResourceType::Route)
            .with_resource_id(route.id())
            .with_requested(&route);
        let ip = self.ip.clone();
        self.mutations
            .execute(actor, Permission::RoutesWrite, LockScope::Routing, intent, move || {
                let ip = ip.clone();
                let route = route.clone();
                async move {
                    route.validate()?;
                    ip.run(&route.native_args("add")).await?;
                    info!(route = %route.id(), "Added route");
                    let listed = iproute::parse_routes(&ip.query(&ROUTES).await?)?;
                    Ok(listed.into_iter().find(|r| r.selects(&route)).unwrap_or(route))
                }
            })
            .await
    }

    /// Deletes the listed route `wanted` selects, returning it.
    pub async fn delete_route(&self, actor: &Actor, wanted: Route) -> Result<Route> {
        let intent = Intent::new(AuditAction::Delete, ResourceType::Route).with_resource_id(wanted.id());
        let ip = self.ip.clone();
        self.mutations
            .execute(actor, Permission::RoutesWrite, LockScope::Routing, intent, move || {
                let ip = ip.clone();
                let wanted = wanted.clone();
                async move {
                    let listed = iproute::parse_routes(&ip.query(&ROUTES).await?)?;
                    let Some(target) = listed.into_iter().find(|r| r.selects(&wanted)) else {
                        return Err(Error::RuleNotFound {
                            scope: "routing".to_string(),
                            id: wanted.id(),
                        });
                    };
                    ip.run(&target.native_args("del"))
                        .await
                        .map_err(|e| e.for_id(&target.id()))?;
                    info!(route = %target.id(), "Deleted route");
                    Ok(target)
                }
            })
            .await
    }

    /// Adds a policy rule; a priority already in use is a `Conflict`.
    pub async fn add_ip_rule(&self, actor: &Actor, rule: IpPolicyRule) -> Result<IpPolicyRule> {
        let intent = Intent::new(AuditAction::Create, ResourceType::IpRule)
            .with_resource_id(rule.priority.to_string())
            .with_requested(&rule);
        let ip = self.ip.clone();
        self.mutations
            .execute(actor, Permission::RoutesWrite, LockScope::Routing, intent, move || {
                let ip = ip.clone();
                let rule = rule.clone();
                async move {
                    rule.validate()?;
                    let current = iproute::parse_rules(&ip.query(&RULES).await?)?;
                    if current.iter().any(|r| r.priority == rule.priority) {
                        return Err(Error::Conflict(format!(
                            "ip rule priority {} is already in use",
                            rule.priority
                        )));
                    }
                    ip.run(&rule.add_args()).await?;
                    info!(priority = rule.priority, "Added ip rule");
                    let listed = iproute::parse_rules(&ip.query(&RULES).await?)?;
                    Ok(listed
                        .into_iter()
                        .find(|r| r.priority == rule.priority)
                        .unwrap_or(rule))
                }
            })
            .await
    }

    pub async fn delete_ip_rule(&self, actor: &Actor, priority: u32) -> Result<IpPolicyRule> {
        let id = priority.to_string();
        let intent = Intent::new(AuditAction::Delete, ResourceType::IpRule).with_resource_id(id.clone());
        let ip = self.ip.clone();
        self.mutations
            .execute(actor, Permission::RoutesWrite, LockScope::Routing, intent, move || {
                let ip = ip.clone();
                let id = id.clone();
                async move {
                    let current = iproute::parse_rules(&ip.query(&RULES).await?)?;
                    let Some(target) = current.into_iter().find(|r| r.priority == priority) else {
                        return Err(Error::RuleNotFound {
                            scope: "ip rule".to_string(),
                            id,
                        });
                    };
                    ip.run(&argv(["rule", "del", "priority", id.as_str()]))
                        .await
                        .map_err(|e| e.for_id(&id))?;
                    info!(priority, "Deleted ip rule");
                    Ok(target)
                }
            })
            .await
    }
}

/// Interfaces as the OS reports them, without state or MTU
fn os_interfaces() -> Result<Vec<NetworkInterface>> {
    let found = network_interface::NetworkInterface::show()
        .map_err(|e| Error::BackendUnavailable {
            target: "interfaces".to_string(),
            reason: e.to_string(),
        })?;
    Ok(found
        .into_iter()
        .map(|iface| {
            let addresses: Vec<InterfaceAddress> = iface
                .addr
                .iter()
                .map(|addr| match addr {
                    Addr::V4(v4) => InterfaceAddress {
                        address: v4.ip.into(),
                        prefix_len: v4
                            .netmask
                            .map_or(32, |m| u8::try_from(u32::from(m).count_ones()).unwrap_or(32)),
                        scope: None,
                    },
                    Addr::V6(v6) => InterfaceAddress {
                        address: v6.ip.into(),
                        prefix_len: v6
                            .netmask
                            .map_or(128, |m| u8::try_from(u128::from(m).count_ones()).unwrap_or(128)),
                        scope: None,
                    },
                })
                .collect();
            NetworkInterface {
                is_loopback: addresses.iter().any(|a| a.address.is_loopback()),
                name: iface.name,
                index: Some(iface.index),
                state: "UNKNOWN".to_string(),
                mtu: None,
                mac: iface.mac_addr.filter(|m| m != "00:00:00:00:00:00"),
                addresses,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLog;
    use crate::core::access::Role;
    use crate::core::coordinator::Coordinator;
    use crate::core::error::StatusCode;
    use crate::core::test_helpers::FakeRunner;

    const RULES_JSON: &str = r#"[{"priority":0,"src":"all","table":"local"},{"priority":100,"src":"10.8.0.0","srclen":24,"table":"vpn"},{"priority":32766,"src":"all","table":"main"}]"#;
    const ROUTES_JSON: &str = r#"[{"dst":"default","gateway":"192.168.1.1","dev":"eth0","protocol":"dhcp","metric":100,"flags":[]},{"dst":"192.168.1.0/24","dev":"eth0","protocol":"kernel","scope":"link","metric":100,"flags":[]}]"#;

    fn manager(runner: Arc<FakeRunner>) -> (NetworkManager, Arc<MemoryAuditLog>) {
        let audit = Arc::new(MemoryAuditLog::new());
        let mutations = MutationContext::new(Arc::new(Coordinator::default()), audit.clone());
        (NetworkManager::new(runner, Duration::from_secs(5), mutations), audit)
    }

    fn admin() -> Actor {
        Actor::new("alice", Role::Admin)
    }

    #[tokio::test]
    async fn test_duplicate_priority_conflicts_before_dispatch() {
        let runner = FakeRunner::new().with_tool("ip").into_arc();
        runner.ok("ip -j rule show", RULES_JSON);
        let (net, audit) = manager(runner.clone());

        let err = net
            .add_ip_rule(&admin(), IpPolicyRule::lookup(100, "200"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(runner.calls().iter().all(|c| !c.starts_with("ip rule add")));
        assert_eq!(audit.events().len(), 1);
    }

    #[tokio::test]
    async fn test_add_ip_rule_relists() {
        let runner = FakeRunner::new().with_tool("ip").into_arc();
        runner.ok("ip -j rule show", RULES_JSON);
        runner.ok(
            "ip -j rule show",
            r#"[{"priority":0,"src":"all","table":"local"},{"priority":100,"src":"10.8.0.0","srclen":24,"table":"vpn"},{"priority":150,"src":"all","fwmark":"0x2","table":"200"},{"priority":32766,"src":"all","table":"main"}]"#,
        );
        runner.ok("ip rule add priority 150 fwmark 0x2 table 200", "");
        let (net, audit) = manager(runner.clone());

        let rule = IpPolicyRule {
            firewall_mark: Some("0x2".into()),
            ..IpPolicyRule::lookup(150, "200")
        };
        let added = net.add_ip_rule(&admin(), rule).await.unwrap();
        assert_eq!(added.action.as_deref(), Some("lookup"));
        assert_eq!(runner.count("ip rule add priority 150 fwmark 0x2 table 200"), 1);
        assert_eq!(audit.events()[0].resource_id.as_deref(), Some("150"));
    }

    #[tokio::test]
    async fn test_kernel_file_exists_is_conflict() {
        let runner = FakeRunner::new().with_tool("ip").into_arc();
        runner.ok("ip -j route show table all", ROUTES_JSON);
        runner.fail("ip route add 10.0.0.0/8 via 192.168.1.254", 2, "RTNETLINK answers: File exists");
        let (net, audit) = manager(runner);

        let err = net
            .add_route(&admin(), Route::new("10.0.0.0/8").via("192.168.1.254"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        let event = &audit.events()[0];
        assert!(matches!(
            event.outcome,
            crate::audit::Outcome::Failure { code: StatusCode::Conflict, .. }
        ));
    }

    #[tokio::test]
    async fn test_delete_missing_ip_rule() {
        let runner = FakeRunner::new().with_tool("ip").into_arc();
        runner.ok("ip -j rule show", RULES_JSON);
        let (net, _) = manager(runner.clone());

        let err = net.delete_ip_rule(&admin(), 4242).await.unwrap_err();
        assert!(matches!(err, Error::RuleNotFound { ref id, .. } if id == "4242"));
        assert!(runner.calls().iter().all(|c| !c.starts_with("ip rule del")));
    }

    #[tokio::test]
    async fn test_delete_route_uses_listed_entry() {
        let runner = FakeRunner::new().with_tool("ip").into_arc();
        runner.ok("ip -j route show table all", ROUTES_JSON);
        runner.ok("ip route del default via 192.168.1.1 dev eth0 metric 100", "");
        let (net, _) = manager(runner.clone());

        let removed = net.delete_route(&admin(), Route::new("default")).await.unwrap();
        assert_eq!(removed.protocol.as_deref(), Some("dhcp"));
        assert_eq!(runner.count("ip route del default via 192.168.1.1 dev eth0 metric 100"), 1);

        let err = net
            .delete_route(&admin(), Route::new("172.16.0.0/12"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RuleNotFound { .. }));
    }

    #[tokio::test]
    async fn test_invalid_route_never_dispatched() {
        let runner = FakeRunner::new().with_tool("ip").into_arc();
        let (net, audit) = manager(runner.clone());
        let err = net.add_route(&admin(), Route::new("10.0.0.0/8")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRule(_)));
        assert_eq!(runner.call_count(), 0);
        assert_eq!(audit.events().len(), 1);
    }

    #[tokio::test]
    async fn test_viewer_cannot_change_routes() {
        let runner = FakeRunner::new().with_tool("ip").into_arc();
        let (net, _) = manager(runner.clone());
        let viewer = Actor::new("victor", Role::Viewer);
        let err = net
            .add_route(&viewer, Route::new("10.0.0.0/8").dev("eth0"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden { .. }));
        assert_eq!(runner.call_count(), 0);
    }

    #[tokio::test]
    async fn test_listening_ports_joined() {
        let runner = FakeRunner::new().with_tool("ip").with_tool("ss").into_arc();
        runner.ok(
            "ss -tulnp",
            "Netid State Recv-Q Send-Q Local Address:Port Peer Address:Port Process\ntcp LISTEN 0 4096 0.0.0.0:22 0.0.0.0:* users:((\"sshd\",pid=901,fd=3))\ntcp LISTEN 0 511 192.168.1.10:8080 0.0.0.0:*\n",
        );
        runner.ok(
            "ip -j addr show",
            r#"[{"ifindex":2,"ifname":"eth0","flags":["UP"],"mtu":1500,"operstate":"UP","link_type":"ether","address":"52:54:00:12:34:56","addr_info":[{"family":"inet","local":"192.168.1.10","prefixlen":24,"scope":"global"}]}]"#,
        );
        let (net, _) = manager(runner);

        let ports = net.listening_ports().await.unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].interface, "all");
        assert_eq!(ports[0].process.as_deref(), Some("sshd"));
        assert_eq!(ports[1].interface, "eth0");

        let grouped = net.ports_by_interface().await.unwrap();
        assert_eq!(grouped[0].interface, "all");
    }

    #[tokio::test]
    async fn test_missing_ss_is_unavailable() {
        let runner = FakeRunner::new().with_tool("ip").into_arc();
        let (net, _) = manager(runner);
        assert!(matches!(
            net.listening_ports().await,
            Err(Error::BackendUnavailable { .. })
        ));
    }
}
