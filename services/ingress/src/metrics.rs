//! Prometheus metrics.
//!
//! Recorded through the `metrics` facade; `main` installs the Prometheus
//! recorder and the admin API renders it. Without a recorder every call here
//! is a no-op, which is what unit and integration tests run with.

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

pub const ROUTES: &str = "qumine_ingress_routes";
pub const CONNECTIONS: &str = "qumine_ingress_connections";
pub const ERRORS_TOTAL: &str = "qumine_ingress_errors_total";
pub const BYTES_TOTAL: &str = "qumine_ingress_bytes_total";

/// Value of the `error` label on [`ERRORS_TOTAL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    UpstreamConnectionFailed,
    DecodeHandshakeFailed,
    DecodeLegacyServerListPingFailed,
    InternalError,
    NoMatchingPort,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::UpstreamConnectionFailed => "UpstreamConnectionFailed",
            ErrorKind::DecodeHandshakeFailed => "DecodeHandshakeFailed",
            ErrorKind::DecodeLegacyServerListPingFailed => "DecodeLegacyServerListPingFailed",
            ErrorKind::InternalError => "InternalError",
            ErrorKind::NoMatchingPort => "NoMatchingPort",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relay direction, the `direction` label on [`BYTES_TOTAL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Backend to client.
    Upstream,
    /// Client to backend.
    Downstream,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Upstream => "upstream",
            Direction::Downstream => "downstream",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Install the global Prometheus recorder and register metric help texts.
pub fn install() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe();
    Ok(handle)
}

pub fn describe() {
    describe_gauge!(ROUTES, "The amount of registered routes");
    describe_gauge!(CONNECTIONS, "The amount of active connections");
    describe_counter!(ERRORS_TOTAL, "The total error count");
    describe_counter!(BYTES_TOTAL, "The total bytes transmitted");
}

pub fn set_routes(count: usize) {
    gauge!(ROUTES).set(count as f64);
}

pub fn record_error(kind: ErrorKind) {
    counter!(ERRORS_TOTAL, "error" => kind.as_str()).increment(1);
}

pub fn add_bytes(direction: Direction, route: &str, bytes: u64) {
    counter!(BYTES_TOTAL, "direction" => direction.as_str(), "route" => route.to_string())
        .increment(bytes);
}

/// Holds one unit of the per-route connection gauge for as long as it lives.
#[derive(Debug)]
pub struct ActiveConnection {
    route: String,
}

impl ActiveConnection {
    pub fn open(route: &str) -> Self {
        gauge!(CONNECTIONS, "route" => route.to_string()).increment(1.0);
        Self {
            route: route.to_string(),
        }
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        gauge!(CONNECTIONS, "route" => self.route.clone()).decrement(1.0);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn render(record: impl FnOnce()) -> String {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, record);
        handle.render()
    }

    /// The exposition line of `name` carrying `label`.
    pub(crate) fn sample<'a>(output: &'a str, name: &str, label: &str) -> &'a str {
        output
            .lines()
            .find(|line| line.starts_with(name) && line.contains(label))
            .unwrap_or_else(|| panic!("no {name} sample with {label} in:\n{output}"))
    }

    #[test]
    fn test_error_kind_labels() {
        let output = render(|| {
            record_error(ErrorKind::NotFound);
            record_error(ErrorKind::NotFound);
            record_error(ErrorKind::DecodeLegacyServerListPingFailed);
        });
        assert!(output.contains(r#"qumine_ingress_errors_total{error="NotFound"} 2"#));
        assert!(output.contains(r#"qumine_ingress_errors_total{error="DecodeLegacyServerListPingFailed"} 1"#));
    }

    #[test]
    fn test_active_connection_gauge() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let (held, released) = metrics::with_local_recorder(&recorder, || {
            let first = ActiveConnection::open("10.0.0.1:25565");
            let second = ActiveConnection::open("10.0.0.1:25565");
            drop(first);
            let held = handle.render();
            drop(second);
            (held, handle.render())
        });
        assert!(held.contains(r#"qumine_ingress_connections{route="10.0.0.1:25565"} 1"#));
        assert!(released.contains(r#"qumine_ingress_connections{route="10.0.0.1:25565"} 0"#));
    }

    #[test]
    fn test_bytes_by_direction() {
        let output = render(|| {
            add_bytes(Direction::Downstream, "b:1", 10);
            add_bytes(Direction::Upstream, "b:1", 3);
            add_bytes(Direction::Downstream, "b:1", 5);
        });
        assert!(sample(&output, BYTES_TOTAL, r#"direction="downstream""#).ends_with(" 15"));
        assert!(sample(&output, BYTES_TOTAL, r#"direction="upstream""#).ends_with(" 3"));
    }

    #[test]
    fn test_routes_gauge() {
        let output = render(|| set_routes(4));
        assert!(output.contains("qumine_ingress_routes 4"));
    }
}
