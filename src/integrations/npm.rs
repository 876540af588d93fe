//! Nginx Proxy Manager HTTP API client
//!
//! Authenticates with `POST /api/tokens` and caches the bearer token. A 401
//! on any call invalidates the cache and the call is retried once with a
//! fresh token.

use crate::config::NpmSettings;
use crate::core::coordinator::AuditTarget;
use crate::core::error::{Error, Result};
use crate::core::firewall::Protocol;
use crate::net::model::ListeningPort;
use crate::net::sockets::ALL_INTERFACES;
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const TOOL: &str = "nginx-proxy-manager";

/// The API reports some flags as 0/1 and others as booleans
fn bool_or_int<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }
    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(i) => i != 0,
    })
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct ProxyHost {
    pub id: u64,
    #[serde(default)]
    pub domain_names: Vec<String>,
    pub forward_host: String,
    pub forward_port: u16,
    #[serde(default = "default_scheme")]
    pub forward_scheme: String,
    #[serde(default)]
    pub certificate_id: Option<serde_json::Value>,
    #[serde(default, deserialize_with = "bool_or_int")]
    pub ssl_forced: bool,
    #[serde(default = "yes", deserialize_with = "bool_or_int")]
    pub enabled: bool,
    #[serde(default, deserialize_with = "bool_or_int")]
    pub block_exploits: bool,
    #[serde(default, deserialize_with = "bool_or_int")]
    pub allow_websocket_upgrade: bool,
    #[serde(default)]
    pub access_list_id: u64,
    #[serde(default)]
    pub advanced_config: String,
    #[serde(default)]
    pub created_on: Option<String>,
    #[serde(default)]
    pub modified_on: Option<String>,
}

impl ProxyHost {
    /// Forced SSL or an attached certificate
    pub fn ssl_enabled(&self) -> bool {
        let has_cert = match &self.certificate_id {
            Some(serde_json::Value::Number(n)) => n.as_u64().is_some_and(|id| id > 0),
            Some(serde_json::Value::String(s)) => !s.is_empty(),
            _ => false,
        };
        self.ssl_forced || has_cert
    }
}

impl AuditTarget for ProxyHost {
    fn audit_id(&self) -> Option<String> {
        Some(self.id.to_string())
    }
}

fn default_scheme() -> String {
    "http".to_string()
}

/// Request body for a new proxy host. Omitted flags take the proxy
/// manager's usual defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyHostCreate {
    pub domain_names: Vec<String>,
    pub forward_host: String,
    pub forward_port: u16,
    #[serde(default = "default_scheme")]
    pub forward_scheme: String,
    #[serde(default)]
    pub ssl_forced: bool,
    #[serde(default = "yes")]
    pub block_exploits: bool,
    #[serde(default)]
    pub caching_enabled: bool,
    #[serde(default = "yes")]
    pub allow_websocket_upgrade: bool,
    #[serde(default)]
    pub access_list_id: u64,
    #[serde(default)]
    pub advanced_config: String,
    #[serde(default = "default_meta")]
    pub meta: serde_json::Value,
}

fn default_meta() -> serde_json::Value {
    serde_json::json!({ "letsencrypt_agree": false })
}

impl ProxyHostCreate {
    pub fn new(domain: impl Into<String>, forward_host: impl Into<String>, forward_port: u16) -> Self {
        Self {
            domain_names: vec![domain.into()],
            forward_host: forward_host.into(),
            forward_port,
            forward_scheme: default_scheme(),
            ssl_forced: false,
            block_exploits: true,
            caching_enabled: false,
            allow_websocket_upgrade: true,
            access_list_id: 0,
            advanced_config: String::new(),
            meta: default_meta(),
        }
    }

    /// # Errors
    ///
    /// `InvalidRule` without a domain, forward host or port.
    pub fn validate(&self) -> Result<()> {
        if self.domain_names.is_empty() || self.domain_names.iter().any(|d| d.trim().is_empty()) {
            return Err(Error::InvalidRule("A proxy host needs at least one domain name".to_string()));
        }
        if self.forward_host.trim().is_empty() {
            return Err(Error::InvalidRule("A proxy host needs a forward host".to_string()));
        }
        if self.forward_port == 0 {
            return Err(Error::InvalidRule("Forward port must be between 1 and 65535".to_string()));
        }
        if !matches!(self.forward_scheme.as_str(), "http" | "https") {
            return Err(Error::InvalidRule(format!(
                "Unsupported forward scheme '{}'",
                self.forward_scheme
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct Stream {
    pub id: u64,
    pub incoming_port: u16,
    pub forwarding_host: String,
    pub forwarding_port: u16,
    #[serde(default = "yes", deserialize_with = "bool_or_int")]
    pub tcp_forwarding: bool,
    #[serde(default, deserialize_with = "bool_or_int")]
    pub udp_forwarding: bool,
    #[serde(default = "yes", deserialize_with = "bool_or_int")]
    pub enabled: bool,
}

impl AuditTarget for Stream {
    fn audit_id(&self) -> Option<String> {
        Some(self.id.to_string())
    }
}

/// Request body for a new TCP/UDP stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCreate {
    pub incoming_port: u16,
    pub forwarding_host: String,
    pub forwarding_port: u16,
    #[serde(default = "yes")]
    pub tcp_forwarding: bool,
    #[serde(default)]
    pub udp_forwarding: bool,
}

impl StreamCreate {
    pub fn new(incoming_port: u16, forwarding_host: impl Into<String>, forwarding_port: u16) -> Self {
        Self {
            incoming_port,
            forwarding_host: forwarding_host.into(),
            forwarding_port,
            tcp_forwarding: true,
            udp_forwarding: false,
        }
    }

    /// # Errors
    ///
    /// `InvalidRule` for a zero port, an empty forward host, or a stream
    /// that forwards neither protocol.
    pub fn validate(&self) -> Result<()> {
        if self.incoming_port == 0 || self.forwarding_port == 0 {
            return Err(Error::InvalidRule("Stream ports must be between 1 and 65535".to_string()));
        }
        if self.forwarding_host.trim().is_empty() {
            return Err(Error::InvalidRule("A stream needs a forwarding host".to_string()));
        }
        if !self.tcp_forwarding && !self.udp_forwarding {
            return Err(Error::InvalidRule("A stream must forward TCP, UDP or both".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct RedirectionHost {
    pub id: u64,
    #[serde(default)]
    pub domain_names: Vec<String>,
    #[serde(default = "default_scheme")]
    pub forward_scheme: String,
    pub forward_domain_name: String,
    #[serde(default = "default_redirect_code")]
    pub forward_http_code: u16,
    #[serde(default = "yes", deserialize_with = "bool_or_int")]
    pub preserve_path: bool,
    #[serde(default, deserialize_with = "bool_or_int")]
    pub ssl_forced: bool,
    #[serde(default = "yes", deserialize_with = "bool_or_int")]
    pub enabled: bool,
}

fn default_redirect_code() -> u16 {
    302
}

/// A TLS certificate managed by the proxy manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct Certificate {
    pub id: u64,
    /// `letsencrypt` or `other`
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub nice_name: String,
    #[serde(default)]
    pub domain_names: Vec<String>,
    #[serde(default)]
    pub expires_on: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct AccessList {
    pub id: u64,
    pub name: String,
    /// Any one of the rules admits a client, instead of all of them
    #[serde(default, deserialize_with = "bool_or_int")]
    pub satisfy_any: bool,
    #[serde(default, deserialize_with = "bool_or_int")]
    pub pass_auth: bool,
    #[serde(default)]
    pub proxy_host_count: u64,
}

/// Ports the proxy manager listens on for its streams: one entry per
/// forwarded protocol of each enabled stream.
pub fn stream_ports(streams: &[Stream]) -> Vec<ListeningPort> {
    streams
        .iter()
        .filter(|s| s.enabled)
        .flat_map(|s| {
            [(s.tcp_forwarding, Protocol::Tcp), (s.udp_forwarding, Protocol::Udp)]
                .into_iter()
                .filter(|(on, _)| *on)
                .map(|(_, protocol)| ListeningPort {
                    port: s.incoming_port,
                    protocol,
                    address: "0.0.0.0".to_string(),
                    interface: ALL_INTERFACES.to_string(),
                    process: Some(format!("{TOOL} stream {}", s.id)),
                    pid: None,
                    is_public: true,
                })
        })
        .collect()
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    identity: &'a str,
    secret: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorBody,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    message: String,
}

/// The `error.message` of an API error body, or the body itself
fn error_message(body: &str) -> String {
    serde_json::from_str::<ApiError>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.trim().to_string())
}

pub struct NpmClient {
    http: reqwest::Client,
    settings: NpmSettings,
    token: Mutex<Option<String>>,
}

impl std::fmt::Debug for NpmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NpmClient")
            .field("url", &self.settings.url)
            .field("email", &self.settings.email)
            .finish_non_exhaustive()
    }
}

impl NpmClient {
    /// # Errors
    ///
    /// `Internal` when the HTTP client cannot be built.
    pub fn new(settings: NpmSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .build()
            .map_err(|e| Error::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            settings,
            token: Mutex::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.settings.url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.settings.url)
    }

    fn transport(&self, err: &reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::BackendTimeout {
                program: TOOL.to_string(),
                timeout: self.settings.timeout,
            }
        } else {
            Error::BackendUnavailable {
                target: TOOL.to_string(),
                reason: err.to_string(),
            }
        }
    }

    fn auth_failed() -> Error {
        Error::BackendUnavailable {
            target: TOOL.to_string(),
            reason: "authentication failed".to_string(),
        }
    }

    async fn login(&self) -> Result<String> {
        debug!(url = %self.settings.url, "Requesting proxy manager token");
        let response = self
            .http
            .post(self.url("/api/tokens"))
            .json(&TokenRequest {
                identity: &self.settings.email,
                secret: &self.settings.password,
            })
            .send()
            .await
            .map_err(|e| self.transport(&e))?;
        if matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::BAD_REQUEST) {
            return Err(Self::auth_failed());
        }
        let response = Self::check(response).await?;
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::parse(TOOL, e.to_string()))?;
        Ok(body.token)
    }

    /// The cached token, or a new one when `refresh` is set or none is cached
    async fn token(&self, refresh: bool) -> Result<String> {
        let mut cached = self.token.lock().await;
        if !refresh && let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }
        let token = self.login().await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = error_message(&body);
        Err(match status {
            StatusCode::BAD_REQUEST => Error::InvalidRule(message),
            StatusCode::NOT_FOUND => Error::RuleNotFound {
                scope: "proxy".to_string(),
                id: String::new(),
            },
            StatusCode::UNAUTHORIZED => Self::auth_failed(),
            _ => Error::CommandFailed {
                tool: TOOL.to_string(),
                message: if message.is_empty() { status.to_string() } else { message },
                exit_code: Some(i32::from(status.as_u16())),
            },
        })
    }

    async fn send(&self, method: Method, path: &str, body: Option<&serde_json::Value>) -> Result<Response> {
        let mut refresh = false;
        loop {
            let token = self.token(refresh).await?;
            let mut request = self.http.request(method.clone(), self.url(path)).bearer_auth(token);
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await.map_err(|e| self.transport(&e))?;
            if response.status() == StatusCode::UNAUTHORIZED && !refresh {
                warn!(%path, "Proxy manager token rejected, re-authenticating");
                refresh = true;
                continue;
            }
            return Self::check(response).await;
        }
    }

    async fn json<T: DeserializeOwned>(&self, method: Method, path: &str, body: Option<&serde_json::Value>) -> Result<T> {
        self.send(method, path, body)
            .await?
            .json()
            .await
            .map_err(|e| Error::parse(TOOL, e.to_string()))
    }

    /// Whether the API accepts the configured credentials
    pub async fn check_auth(&self) -> Result<()> {
        self.token(false).await.map(|_| ())
    }

    pub async fn proxy_hosts(&self) -> Result<Vec<ProxyHost>> {
        self.json(Method::GET, "/api/nginx/proxy-hosts", None).await
    }

    pub async fn proxy_host(&self, id: u64) -> Result<ProxyHost> {
        self.json(Method::GET, &format!("/api/nginx/proxy-hosts/{id}"), None)
            .await
            .map_err(|e| e.for_id(&id.to_string()))
    }

    pub async fn streams(&self) -> Result<Vec<Stream>> {
        self.json(Method::GET, "/api/nginx/streams", None).await
    }

    pub async fn create_stream(&self, stream: &StreamCreate) -> Result<Stream> {
        let body = serde_json::to_value(stream)?;
        self.json(Method::POST, "/api/nginx/streams", Some(&body)).await
    }

    pub async fn redirection_hosts(&self) -> Result<Vec<RedirectionHost>> {
        self.json(Method::GET, "/api/nginx/redirection-hosts", None).await
    }

    pub async fn certificates(&self) -> Result<Vec<Certificate>> {
        self.json(Method::GET, "/api/nginx/certificates", None).await
    }

    pub async fn access_lists(&self) -> Result<Vec<AccessList>> {
        self.json(Method::GET, "/api/nginx/access-lists", None).await
    }

    pub async fn create_proxy_host(&self, host: &ProxyHostCreate) -> Result<ProxyHost> {
        let body = serde_json::to_value(host)?;
        self.json(Method::POST, "/api/nginx/proxy-hosts", Some(&body)).await
    }

    /// Deletes a proxy host and returns it as it was before removal.
    pub async fn delete_proxy_host(&self, id: u64) -> Result<ProxyHost> {
        let existing = self.proxy_host(id).await?;
        self.send(Method::DELETE, &format!("/api/nginx/proxy-hosts/{id}"), None)
            .await
            .map_err(|e| e.for_id(&id.to_string()))?;
        Ok(existing)
    }
}
