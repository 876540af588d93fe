//! unifw - unified firewall, routing and exposure CLI
//!
//! # Usage
//!
//! ```bash
//! unifw backends --refresh                       # Probe installed firewall tools
//! unifw rules list                               # Rules of the preferred backend
//! unifw --backend nftables rules add allow --port 443 --protocol tcp
//! unifw rules delete 3                           # Delete by native id
//! unifw block 3306 --interface eth0              # Deny inbound 3306/tcp on eth0
//! unifw objects                                  # ufw apps, firewalld zones or nft tables
//! unifw routes add 10.20.0.0/16 --via 192.168.1.1 --dev eth0
//! unifw ports --by-interface                     # Listening sockets per interface
//! unifw exposure                                 # System, Docker and proxy ports
//! unifw audit --by alice --since 2026-10-01T00:00:00Z
//! unifw audit --summary                          # Counts by action, actor and outcome
//! ```
//!
//! Output is pretty-printed JSON. Errors print `Error [Code]: message` and
//! exit non-zero.

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::process::ExitCode;
use unifw::audit::{AuditAction, AuditQuery, ResourceType};
use unifw::integrations::{ProxyHostCreate, StreamCreate};
use unifw::net::{IpPolicyRule, Route};
use unifw::{Action, Actor, Address, BackendKind, Direction, FirewallRule, PortSpec, Protocol, Role, Unifw};

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "unifw")]
#[command(about = "One interface over ufw, iptables, firewalld and nftables", long_about = None)]
struct Cli {
    /// Firewall backend to use instead of the preferred one
    #[arg(short, long, global = true)]
    backend: Option<BackendKind>,
    /// Caller identity as NAME or NAME:ROLE (admin, operator, viewer)
    #[arg(long, global = true, value_parser = parse_actor)]
    actor: Option<Actor>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show which firewall backends are installed and preferred
    Backends {
        /// Probe again instead of using the cached result
        #[arg(long)]
        refresh: bool,
    },
    /// Show the firewall's enabled state and default policies
    Status,
    /// List, add or delete firewall rules
    #[command(subcommand)]
    Rules(RuleCommands),
    /// Deny inbound traffic to a port
    Block {
        port: u16,
        #[arg(short, long, default_value = "tcp")]
        protocol: Protocol,
        /// Only on this interface; `all` or omitted blocks everywhere
        #[arg(short, long)]
        interface: Option<String>,
    },
    /// Show the backend's application profiles, zones or tables
    Objects,
    /// Enable the firewall
    Enable,
    /// Disable the firewall
    Disable,
    /// List, add or delete routes
    #[command(subcommand)]
    Routes(RouteCommands),
    /// List, add or delete policy routing rules
    #[command(subcommand)]
    IpRules(IpRuleCommands),
    /// Show the neighbour (ARP) table
    Arp,
    /// Show network interfaces and their addresses
    Interfaces,
    /// Show listening TCP and UDP sockets
    Ports {
        /// Group ports under the interface they bind
        #[arg(long)]
        by_interface: bool,
    },
    /// Show every exposed port: system, Docker and proxy streams
    Exposure,
    /// Docker containers (the default), networks and logs
    Docker {
        #[command(subcommand)]
        command: Option<DockerCommands>,
    },
    /// Nginx Proxy Manager hosts and streams
    #[command(subcommand)]
    Proxy(ProxyCommands),
    /// Query the audit log
    Audit(AuditArgs),
    /// Show build information
    Version,
}

#[derive(Subcommand)]
enum RuleCommands {
    List,
    Add(RuleArgs),
    /// Delete the rule with the given native id
    Delete { id: String },
}

#[derive(Args)]
struct RuleArgs {
    /// allow, deny, reject or limit
    action: Action,
    #[arg(short, long, default_value = "in")]
    direction: Direction,
    #[arg(short, long, default_value = "any")]
    protocol: Protocol,
    /// Port, range (1000:2000) or application profile
    #[arg(long)]
    port: Option<PortSpec>,
    /// Source address or CIDR
    #[arg(short, long, default_value = "any")]
    source: Address,
    /// Destination address or CIDR
    #[arg(long, default_value = "any")]
    destination: Address,
    /// Incoming interface, or outgoing for outbound rules
    #[arg(short, long)]
    interface: Option<String>,
    #[arg(short, long)]
    comment: Option<String>,
}

impl RuleArgs {
    fn into_rule(self) -> FirewallRule {
        let mut rule = FirewallRule::new(self.action)
            .with_direction(self.direction)
            .with_protocol(self.protocol)
            .with_source(self.source)
            .with_destination(self.destination);
        if let Some(interface) = self.interface {
            rule = rule.with_interface(interface);
        }
        if let Some(port) = self.port {
            rule = rule.with_port(port);
        }
        if let Some(comment) = self.comment {
            rule = rule.with_comment(comment);
        }
        rule
    }
}

#[derive(Subcommand)]
enum RouteCommands {
    List,
    Add(RouteArgs),
    Del(RouteArgs),
}

#[derive(Args)]
struct RouteArgs {
    /// CIDR or `default`
    destination: String,
    #[arg(long)]
    via: Option<String>,
    #[arg(long)]
    dev: Option<String>,
    #[arg(long)]
    metric: Option<u32>,
    #[arg(long)]
    table: Option<String>,
    /// unicast, blackhole, unreachable, prohibit, local or throw
    #[arg(long = "type")]
    route_type: Option<String>,
}

impl From<RouteArgs> for Route {
    fn from(args: RouteArgs) -> Self {
        Route {
            gateway: args.via,
            interface: args.dev,
            metric: args.metric,
            table: args.table,
            route_type: args.route_type,
            ..Route::new(args.destination)
        }
    }
}

#[derive(Subcommand)]
enum IpRuleCommands {
    List,
    Add {
        priority: u32,
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
        #[arg(long)]
        fwmark: Option<String>,
        #[arg(long)]
        table: Option<String>,
        /// blackhole, unreachable or prohibit instead of a table lookup
        #[arg(long)]
        action: Option<String>,
    },
    Del {
        priority: u32,
    },
}

#[derive(Subcommand)]
enum DockerCommands {
    Containers,
    Networks,
    /// Show the last log lines of a container
    Logs {
        container: String,
        #[arg(long, default_value_t = 100)]
        tail: u32,
    },
}

#[derive(Subcommand)]
enum ProxyCommands {
    Hosts,
    Streams,
    Redirections,
    Certificates,
    AccessLists,
    /// Create a stream forwarding PORT to HOST:FORWARD_PORT
    AddStream {
        incoming_port: u16,
        forward_host: String,
        forward_port: u16,
        /// Forward UDP as well
        #[arg(long)]
        udp: bool,
        /// Forward UDP only
        #[arg(long, requires = "udp")]
        no_tcp: bool,
    },
    /// Create a proxy host forwarding DOMAIN to HOST:PORT
    Add {
        domain: String,
        forward_host: String,
        forward_port: u16,
        #[arg(long, default_value = "http")]
        scheme: String,
        #[arg(long)]
        ssl_forced: bool,
    },
    /// Delete the proxy host with the given id
    Delete { id: u64 },
}

#[derive(Args)]
struct AuditArgs {
    /// Only events recorded for this actor
    #[arg(long = "by")]
    by_actor: Option<String>,
    #[arg(long)]
    action: Option<AuditAction>,
    #[arg(long)]
    resource_type: Option<ResourceType>,
    /// RFC 3339 timestamp
    #[arg(long)]
    since: Option<DateTime<Utc>>,
    #[arg(long)]
    until: Option<DateTime<Utc>>,
    #[arg(long, default_value_t = 50)]
    limit: usize,
    /// Print counts over the matching events instead of the events
    #[arg(long)]
    summary: bool,
}

fn parse_actor(s: &str) -> Result<Actor, String> {
    let (name, role) = match s.split_once(':') {
        Some((name, role)) => (name, role.parse::<Role>().map_err(|_| format!("Unknown role '{role}'"))?),
        None => (s, Role::Admin),
    };
    if name.is_empty() {
        return Err("Actor name is empty".to_string());
    }
    Ok(Actor::new(name, role))
}

fn init_logging() {
    // Log to file so JSON on stdout stays clean
    if let Some(mut log_path) = unifw::utils::get_state_dir() {
        log_path.push("unifw.log");
        if let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(log_path) {
            tracing_subscriber::fmt().with_writer(file).with_ansi(false).init();
            return;
        }
    }
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
}

fn main() -> ExitCode {
    let dirs = unifw::utils::ensure_dirs();
    init_logging();
    if let Err(e) = dirs {
        tracing::warn!(error = %e, "Could not create state directories");
    }
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error [Internal]: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(handle_cli(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error [{}]: {e}", e.status_code());
            ExitCode::FAILURE
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> unifw::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn handle_cli(cli: Cli) -> unifw::Result<()> {
    if matches!(cli.command, Commands::Version) {
        return print_json(&serde_json::json!({
            "version": build::PKG_VERSION,
            "commit": build::SHORT_COMMIT,
            "branch": build::BRANCH,
            "clean": build::GIT_CLEAN,
            "buildTime": build::BUILD_TIME,
            "rustc": build::RUST_VERSION,
        }));
    }

    let config = unifw::config::load_config().await;
    let unifw = Unifw::new(&config)?;
    let actor = cli.actor.unwrap_or_else(Actor::local_admin);
    let backend = cli.backend;

    match cli.command {
        Commands::Backends { refresh } => print_json(&unifw.backends(&actor, refresh).await?),
        Commands::Status => print_json(&unifw.status(&actor, backend).await?),
        Commands::Rules(cmd) => match cmd {
            RuleCommands::List => print_json(&unifw.list_rules(&actor, backend).await?),
            RuleCommands::Add(args) => print_json(&unifw.add_rule(&actor, backend, args.into_rule()).await?),
            RuleCommands::Delete { id } => print_json(&unifw.delete_rule(&actor, backend, &id).await?),
        },
        Commands::Block {
            port,
            protocol,
            interface,
        } => print_json(&unifw.block_port(&actor, backend, port, protocol, interface).await?),
        Commands::Objects => print_json(&unifw.native_objects(&actor, backend).await?),
        Commands::Enable => print_json(&unifw.enable(&actor, backend).await?),
        Commands::Disable => print_json(&unifw.disable(&actor, backend).await?),
        Commands::Routes(cmd) => match cmd {
            RouteCommands::List => print_json(&unifw.routes(&actor).await?),
            RouteCommands::Add(args) => print_json(&unifw.add_route(&actor, args.into()).await?),
            RouteCommands::Del(args) => print_json(&unifw.delete_route(&actor, args.into()).await?),
        },
        Commands::IpRules(cmd) => match cmd {
            IpRuleCommands::List => print_json(&unifw.ip_rules(&actor).await?),
            IpRuleCommands::Add {
                priority,
                from,
                to,
                fwmark,
                table,
                action,
            } => {
                let rule = IpPolicyRule {
                    priority,
                    source: from,
                    destination: to,
                    firewall_mark: fwmark,
                    table,
                    action,
                };
                print_json(&unifw.add_ip_rule(&actor, rule).await?)
            }
            IpRuleCommands::Del { priority } => print_json(&unifw.delete_ip_rule(&actor, priority).await?),
        },
        Commands::Arp => print_json(&unifw.arp_table(&actor).await?),
        Commands::Interfaces => print_json(&unifw.interfaces(&actor).await?),
        Commands::Ports { by_interface } => {
            if by_interface {
                print_json(&unifw.ports_by_interface(&actor).await?)
            } else {
                print_json(&unifw.listening_ports(&actor).await?)
            }
        }
        Commands::Exposure => print_json(&unifw.exposure(&actor).await?),
        Commands::Docker { command } => match command.unwrap_or(DockerCommands::Containers) {
            DockerCommands::Containers => print_json(&unifw.docker_containers(&actor).await?),
            DockerCommands::Networks => print_json(&unifw.docker_networks(&actor).await?),
            DockerCommands::Logs { container, tail } => {
                print!("{}", unifw.container_logs(&actor, &container, tail).await?);
                Ok(())
            }
        },
        Commands::Proxy(cmd) => match cmd {
            ProxyCommands::Hosts => print_json(&unifw.proxy_hosts(&actor).await?),
            ProxyCommands::Streams => print_json(&unifw.streams(&actor).await?),
            ProxyCommands::Redirections => print_json(&unifw.redirection_hosts(&actor).await?),
            ProxyCommands::Certificates => print_json(&unifw.certificates(&actor).await?),
            ProxyCommands::AccessLists => print_json(&unifw.access_lists(&actor).await?),
            ProxyCommands::AddStream {
                incoming_port,
                forward_host,
                forward_port,
                udp,
                no_tcp,
            } => {
                let stream = StreamCreate {
                    tcp_forwarding: !no_tcp,
                    udp_forwarding: udp,
                    ..StreamCreate::new(incoming_port, forward_host, forward_port)
                };
                print_json(&unifw.create_stream(&actor, stream).await?)
            }
            ProxyCommands::Add {
                domain,
                forward_host,
                forward_port,
                scheme,
                ssl_forced,
            } => {
                let host = ProxyHostCreate {
                    forward_scheme: scheme,
                    ssl_forced,
                    ..ProxyHostCreate::new(domain, forward_host, forward_port)
                };
                print_json(&unifw.create_proxy_host(&actor, host).await?)
            }
            ProxyCommands::Delete { id } => print_json(&unifw.delete_proxy_host(&actor, id).await?),
        },
        Commands::Audit(args) => {
            let query = AuditQuery {
                actor: args.by_actor,
                action: args.action,
                resource_type: args.resource_type,
                since: args.since,
                until: args.until,
                limit: Some(args.limit),
            };
            if args.summary {
                print_json(&unifw.audit_summary(&actor, &query).await?)
            } else {
                print_json(&unifw.audit_events(&actor, &query).await?)
            }
        }
        Commands::Version => Ok(()),
    }
}
