//! Ingress configuration.
//!
//! Every flag can also be set through the environment variable named next
//! to it.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use qumine_events::RouteSpec;

use crate::proxy::{ConnectionConfig, ListenerConfig};

/// How the Kubernetes API is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KubeMode {
    /// Service account credentials mounted into the pod.
    InCluster,
    /// Explicit API URL, e.g. a local `kubectl proxy`.
    Url,
    /// Do not watch Kubernetes; only static routes are served.
    Disabled,
}

/// Ingress configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "ingress", version, about = "Hostname-routing ingress for Minecraft servers")]
pub struct Config {
    /// Address to accept Minecraft connections on.
    #[arg(long, env = "INGRESS_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Port to accept Minecraft connections on.
    #[arg(long, env = "INGRESS_PORT", default_value_t = 25565)]
    pub port: u16,

    /// Address of the admin API.
    #[arg(long, env = "API_HOST", default_value = "0.0.0.0")]
    pub api_host: IpAddr,

    /// Port of the admin API.
    #[arg(long, env = "API_PORT", default_value_t = 8080)]
    pub api_port: u16,

    /// Time a client has to send its first packet.
    #[arg(long, env = "HANDSHAKE_TIMEOUT_MS", default_value_t = 5000)]
    pub handshake_timeout_ms: u64,

    /// Time allowed for dialing a backend.
    #[arg(long, env = "CONNECT_TIMEOUT_MS", default_value_t = 2000)]
    pub connect_timeout_ms: u64,

    #[arg(long, env = "KUBE_MODE", value_enum, default_value_t = KubeMode::InCluster)]
    pub kube_mode: KubeMode,

    /// Kubernetes API base URL, required with `--kube-mode url`.
    #[arg(long, env = "KUBE_API_URL", required_if_eq("kube_mode", "url"))]
    pub kube_api_url: Option<String>,

    /// Bearer token file; defaults to the service account token in-cluster.
    #[arg(long, env = "KUBE_TOKEN_FILE")]
    pub kube_token_file: Option<PathBuf>,

    /// CA bundle for the API server; defaults to the service account CA in-cluster.
    #[arg(long, env = "KUBE_CA_FILE")]
    pub kube_ca_file: Option<PathBuf>,

    /// Only watch services in this namespace.
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Static route, repeatable.
    #[arg(
        long = "route",
        env = "STATIC_ROUTES",
        value_name = "HOST=BACKEND",
        value_delimiter = ',',
        value_parser = parse_static_route
    )]
    pub routes: Vec<RouteSpec>,

    /// Log at debug level.
    #[arg(long, env = "DEBUG")]
    pub debug: bool,

    /// Log at trace level.
    #[arg(long, env = "TRACE")]
    pub trace: bool,
}

fn parse_static_route(raw: &str) -> Result<RouteSpec, String> {
    let (host, backend) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected HOST=BACKEND, got {raw:?}"))?;
    RouteSpec::new(host.trim(), backend.trim()).map_err(|e| e.to_string())
}

impl Config {
    /// Load configuration from the command line and environment.
    pub fn load() -> Self {
        Self::parse()
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn api_addr(&self) -> SocketAddr {
        SocketAddr::new(self.api_host, self.api_port)
    }

    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            bind_addr: self.listen_addr(),
            connection: ConnectionConfig {
                handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
                connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            },
        }
    }

    /// Log level (trace, debug, info).
    pub fn log_level(&self) -> &'static str {
        if self.trace {
            "trace"
        } else if self.debug {
            "debug"
        } else {
            "info"
        }
    }
}
