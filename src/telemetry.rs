// Exporter self metrics - served on /metrics
//
// Query timings, result counts, request counts and the remaining API quota,
// plus process metrics where the platform supports them. The registry is owned
// by the application state; nothing is registered globally.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

const QUERY_LABELS: &[&str] = &["module", "metric"];

pub struct ExporterMetrics {
    registry: Registry,

    /// Duration of all pages of one query, in seconds
    pub query_time: HistogramVec,

    /// Total records reported for the last execution of a query
    pub query_results: GaugeVec,

    /// Number of page requests sent to the query API
    pub query_requests: CounterVec,

    /// Remaining request quota reported by the query API
    pub ratelimit: Gauge,
}

impl ExporterMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let query_time = HistogramVec::new(
            HistogramOpts::new(
                "azure_resourcegraph_query_time",
                "Azure ResourceGraph Query time",
            ),
            QUERY_LABELS,
        )?;
        registry.register(Box::new(query_time.clone()))?;

        let query_results = GaugeVec::new(
            Opts::new(
                "azure_resourcegraph_query_results",
                "Azure ResourceGraph query results",
            ),
            QUERY_LABELS,
        )?;
        registry.register(Box::new(query_results.clone()))?;

        let query_requests = CounterVec::new(
            Opts::new(
                "azure_resourcegraph_query_request_count",
                "Azure ResourceGraph query request count",
            ),
            QUERY_LABELS,
        )?;
        registry.register(Box::new(query_requests.clone()))?;

        let ratelimit = Gauge::new("azure_resourcegraph_ratelimit", "Azure ResourceGraph ratelimit")?;
        registry.register(Box::new(ratelimit.clone()))?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(prometheus::process_collector::ProcessCollector::for_self()))?;

        Ok(ExporterMetrics {
            registry,
            query_time,
            query_results,
            query_requests,
            ratelimit,
        })
    }

    /// Renders all exporter metrics in the Prometheus text format
    pub fn render(&self) -> prometheus::Result<String> {
        encode_text(&self.registry)
    }
}

/// Encodes everything gathered from a registry in the Prometheus text format
pub fn encode_text(registry: &Registry) -> prometheus::Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;

    String::from_utf8(buffer).map_err(|err| prometheus::Error::Msg(err.to_string()))
}
