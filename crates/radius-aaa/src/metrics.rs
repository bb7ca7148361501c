//! Request counters and Prometheus exporter
//!
//! Every module wrap in a listener's chain counts its successes and failures
//! under (listener, module). Listeners count received requests, dropped
//! retransmissions, filter rejections, replies and requests that ended
//! without a reply. The counters are rendered in Prometheus text format and
//! optionally served at `GET /metrics`.

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use dashmap::DashMap;
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Outcome counters of one module in one listener's chain
#[derive(Debug, Default)]
pub struct ModuleCounters {
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
}

impl ModuleCounters {
    pub fn record(&self, success: bool) {
        let counter = if success { &self.succeeded } else { &self.failed };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-listener request counters
#[derive(Debug, Default)]
pub struct ListenerCounters {
    pub requests: AtomicU64,
    /// Shared with the listener, which hands it out as its drop counter
    pub duplicates: Arc<AtomicU64>,
    pub filtered: AtomicU64,
    pub replies: AtomicU64,
    pub no_reply: AtomicU64,
}

impl ListenerCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// All counters of one server
#[derive(Debug)]
pub struct Counters {
    modules: DashMap<(String, String), Arc<ModuleCounters>>,
    listeners: DashMap<String, Arc<ListenerCounters>>,
    started_at: Instant,
}

impl Default for Counters {
    fn default() -> Self {
        Self::new()
    }
}

impl Counters {
    pub fn new() -> Self {
        Self {
            modules: DashMap::new(),
            listeners: DashMap::new(),
            started_at: Instant::now(),
        }
    }

    /// Counters for `module` in `listener`'s chain, created on first use
    pub fn module(&self, listener: &str, module: &str) -> Arc<ModuleCounters> {
        self.modules
            .entry((listener.to_string(), module.to_string()))
            .or_default()
            .clone()
    }

    pub fn listener(&self, listener: &str) -> Arc<ListenerCounters> {
        self.listeners
            .entry(listener.to_string())
            .or_default()
            .clone()
    }

    pub fn render(&self) -> PrometheusMetrics {
        let mut metrics = PrometheusMetrics::new();

        let mut modules: Vec<_> = self
            .modules
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        modules.sort_by(|a, b| a.0.cmp(&b.0));

        let mut listeners: Vec<_> = self
            .listeners
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        listeners.sort_by(|a, b| a.0.cmp(&b.0));

        metrics.add_header(
            "radius_module_requests_total",
            "Module invocations by outcome",
            "counter",
        );
        for ((listener, module), counters) in &modules {
            for (outcome, counter) in [("success", &counters.succeeded), ("failure", &counters.failed)]
            {
                metrics.add_series(
                    "radius_module_requests_total",
                    &[
                        ("listener", listener.as_str()),
                        ("module", module.as_str()),
                        ("outcome", outcome),
                    ],
                    counter.load(Ordering::Relaxed),
                );
            }
        }

        let listener_families: [(&str, &str, fn(&ListenerCounters) -> u64); 5] = [
            ("radius_requests_total", "Requests received", |c: &ListenerCounters| {
                c.requests.load(Ordering::Relaxed)
            }),
            (
                "radius_duplicates_dropped_total",
                "Retransmissions dropped by the dedup cache",
                |c: &ListenerCounters| c.duplicates.load(Ordering::Relaxed),
            ),
            ("radius_filtered_total", "Requests rejected by a filter", |c: &ListenerCounters| {
                c.filtered.load(Ordering::Relaxed)
            }),
            ("radius_replies_total", "Replies produced", |c: &ListenerCounters| {
                c.replies.load(Ordering::Relaxed)
            }),
            (
                "radius_no_reply_total",
                "Requests that ended without a reply",
                |c: &ListenerCounters| c.no_reply.load(Ordering::Relaxed),
            ),
        ];
        for (name, help, read) in listener_families {
            metrics.add_header(name, help, "counter");
            for (listener, counters) in &listeners {
                metrics.add_series(name, &[("listener", listener.as_str())], read(counters));
            }
        }

        metrics.add_counter(
            "radius_uptime_seconds",
            self.started_at.elapsed().as_secs(),
            "Server uptime in seconds",
        );

        metrics
    }
}

/// Prometheus metrics in text format
#[derive(Debug, Clone, Default)]
pub struct PrometheusMetrics {
    pub content: String,
}

impl PrometheusMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_header(&mut self, name: &str, help: &str, kind: &str) {
        self.content.push_str(&format!("# HELP {} {}\n", name, help));
        self.content.push_str(&format!("# TYPE {} {}\n", name, kind));
    }

    fn add_series(&mut self, name: &str, labels: &[(&str, &str)], value: impl Display) {
        let label_str = labels
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v))
            .collect::<Vec<_>>()
            .join(",");

        self.content
            .push_str(&format!("{}{{{}}} {}\n", name, label_str, value));
    }

    fn add_counter(&mut self, name: &str, value: impl Display, help: &str) {
        self.add_header(name, help, "counter");
        self.content.push_str(&format!("{} {}\n", name, value));
    }
}

async fn metrics_handler(State(counters): State<Arc<Counters>>) -> Response {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        counters.render().content,
    )
        .into_response()
}

pub fn metrics_router(counters: Arc<Counters>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(counters)
}

/// Bind the scrape endpoint and serve it in the background
pub async fn start_metrics_server(
    counters: Arc<Counters>,
    addr: SocketAddr,
) -> std::io::Result<JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %listener.local_addr()?, "Metrics server listening");

    let app = metrics_router(counters);
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Metrics server failed");
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_counters_shared() {
        let counters = Counters::new();
        counters.module("auth", "a").record(true);
        counters.module("auth", "a").record(false);
        counters.module("auth", "a").record(true);

        let module = counters.module("auth", "a");
        assert_eq!(module.succeeded.load(Ordering::Relaxed), 2);
        assert_eq!(module.failed.load(Ordering::Relaxed), 1);
        assert_eq!(counters.module("acct", "a").succeeded.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_listener_duplicate_counter_is_shared() {
        let counters = Counters::new();
        let handle = Arc::clone(&counters.listener("auth").duplicates);
        handle.fetch_add(3, Ordering::Relaxed);

        assert_eq!(counters.listener("auth").duplicates.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_render() {
        let counters = Counters::new();
        counters.module("auth", "loopback").record(true);
        ListenerCounters::incr(&counters.listener("auth").requests);

        let content = counters.render().content;
        assert!(content.contains("# TYPE radius_module_requests_total counter"));
        assert!(content.contains(
            "radius_module_requests_total{listener=\"auth\",module=\"loopback\",outcome=\"success\"} 1"
        ));
        assert!(content.contains(
            "radius_module_requests_total{listener=\"auth\",module=\"loopback\",outcome=\"failure\"} 0"
        ));
        assert!(content.contains("radius_requests_total{listener=\"auth\"} 1"));
        assert!(content.contains("radius_duplicates_dropped_total{listener=\"auth\"} 0"));
        assert!(content.contains("# HELP radius_uptime_seconds Server uptime in seconds"));
    }

    #[test]
    fn test_add_counter() {
        let mut metrics = PrometheusMetrics::new();
        metrics.add_counter("test_counter", 100, "A test counter");

        assert!(metrics.content.contains("# HELP test_counter A test counter"));
        assert!(metrics.content.contains("# TYPE test_counter counter"));
        assert!(metrics.content.contains("test_counter 100"));
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let counters = Arc::new(Counters::new());
        ListenerCounters::incr(&counters.listener("acct").replies);

        let handle = start_metrics_server(Arc::clone(&counters), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        handle.abort();

        let response = metrics_handler(State(counters)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
