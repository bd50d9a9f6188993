// Probe handling - runs the queries of one module and renders their metrics
//
// A probe pages through every query configured for the requested module,
// flattens each result row into a `MetricList` and renders the list as
// Prometheus gauges in a registry private to the request. Results can be cached
// per module for a caller-chosen duration.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use prometheus::{GaugeVec, Opts, Registry};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::MAX_TTL;
use crate::config::QueryConfig;
use crate::metrics::{flatten, MetricList};
use crate::server::AppState;
use crate::source::{QueryError, QueryRequest};
use crate::telemetry::encode_text;

/// Page size used when paging through query results
pub const QUERY_PAGE_SIZE: u32 = 1000;

/// Query string of a probe request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeParams {
    #[serde(default)]
    pub module: String,
    /// Cache duration such as `5m`; empty or absent disables caching
    #[serde(default)]
    pub cache: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid duration \"{0}\"")]
pub struct InvalidDuration(pub String);

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error(transparent)]
    InvalidCacheDuration(#[from] InvalidDuration),

    #[error("cache duration \"{0}\" exceeds the maximum of {}", humantime::format_duration(MAX_TTL))]
    CacheDurationTooLong(String),

    #[error("query \"{metric}\": {source}")]
    Query {
        metric: String,
        #[source]
        source: QueryError,
    },

    #[error("unable to encode metrics: {0}")]
    Encode(#[from] prometheus::Error),
}

/// Rendered probe response
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    /// Prometheus text exposition
    pub body: String,
    /// Whether the metrics were served from the cache
    pub cached: bool,
    /// Expiry of the freshly stored cache entry, if one was stored
    pub cached_until: Option<DateTime<Utc>>,
}

/// Parses a duration like `300s`, `5m` or `1h 30m`
///
/// A bare `0` is accepted as zero.
pub fn parse_duration(input: &str) -> Result<Duration, InvalidDuration> {
    match input.trim() {
        "0" => Ok(Duration::ZERO),
        value => humantime::parse_duration(value).map_err(|_| InvalidDuration(input.to_string())),
    }
}

/// Handles one probe request
///
/// With a positive cache duration the module's build lock is held while the
/// cache is checked and (on a miss) the metrics are collected and stored.
/// Modules without queries are never cached.
pub async fn probe(state: &AppState, params: &ProbeParams) -> Result<ProbeOutcome, ProbeError> {
    let started = Instant::now();
    let module = params.module.as_str();

    let cache_time = match params.cache.as_deref().map(str::trim) {
        None | Some("") => Duration::ZERO,
        Some(value) => {
            let cache_time = parse_duration(value)?;
            if cache_time > MAX_TTL {
                return Err(ProbeError::CacheDurationTooLong(value.to_string()));
            }
            cache_time
        }
    };

    let has_queries = state.config.queries_for_module(module).next().is_some();

    let outcome = if cache_time.is_zero() || !has_queries {
        let list = collect_module(state, module).await?;
        ProbeOutcome {
            body: render_metric_list(&list)?,
            cached: false,
            cached_until: None,
        }
    } else {
        let cache_key = format!("cache:{}", module);
        let build = state.cache.build_lock(&cache_key).await;
        let outcome = cached_probe(state, module, &cache_key, cache_time).await;
        state.cache.release(&cache_key, build).await;
        outcome?
    };

    debug!(module, duration = ?started.elapsed(), "finished request");
    Ok(outcome)
}

/// Serves a module from the cache, collecting and storing it on a miss
///
/// Expects the build lock of `cache_key` to be held.
async fn cached_probe(
    state: &AppState,
    module: &str,
    cache_key: &str,
    cache_time: Duration,
) -> Result<ProbeOutcome, ProbeError> {
    let cached = match state.cache.get(cache_key).await {
        Some(data) => match MetricList::from_bytes(&data) {
            Ok(list) => Some(list),
            Err(err) => {
                debug!(module, "unable to parse cache data: {}", err);
                None
            }
        },
        None => None,
    };

    if let Some(list) = cached {
        debug!(module, "fetched from cache");
        return Ok(ProbeOutcome {
            body: render_metric_list(&list)?,
            cached: true,
            cached_until: None,
        });
    }

    let list = collect_module(state, module).await?;
    let mut cached_until = None;

    match list.to_bytes() {
        Ok(data) => {
            state.cache.set(cache_key, data, cache_time).await;
            cached_until = chrono::Duration::from_std(cache_time)
                .ok()
                .map(|ttl| Utc::now() + ttl);
            debug!(module, "saved metrics to cache for {}", humantime::format_duration(cache_time));
        }
        Err(err) => warn!(module, "unable to serialize metrics for cache: {}", err),
    }

    Ok(ProbeOutcome {
        body: render_metric_list(&list)?,
        cached: false,
        cached_until,
    })
}

/// Runs every query of a module and flattens all result rows
pub async fn collect_module(state: &AppState, module: &str) -> Result<MetricList, ProbeError> {
    let mut list = MetricList::new();

    for query in state.config.queries_for_module(module) {
        collect_query(state, module, query, &mut list).await?;
    }

    if list.is_empty() {
        debug!(module, "no metrics collected");
    } else {
        debug!(
            module,
            families = list.len(),
            rows = list.row_count(),
            "collected metrics"
        );
    }

    Ok(list)
}

async fn collect_query(
    state: &AppState,
    module: &str,
    query: &QueryConfig,
    list: &mut MetricList,
) -> Result<(), ProbeError> {
    let started = Instant::now();
    let metric = query.metric.as_str();
    debug!(module, metric, "starting query");

    let mut request = QueryRequest {
        query: query.query.clone(),
        subscriptions: query
            .subscriptions
            .clone()
            .unwrap_or_else(|| state.subscriptions.clone()),
        skip: 0,
        top: QUERY_PAGE_SIZE,
    };

    let mut total_records = 0u64;
    loop {
        state
            .metrics
            .query_requests
            .with_label_values(&[module, metric])
            .inc();

        let page = state
            .executor
            .execute(&request)
            .await
            .map_err(|source| ProbeError::Query {
                metric: metric.to_string(),
                source,
            })?;

        if let Some(remaining) = page.quota_remaining {
            state.metrics.ratelimit.set(remaining as f64);
        }
        total_records = page.total_records;

        if page.rows.is_empty() {
            break;
        }

        for row in &page.rows {
            list.extend(flatten(metric, &query.metric_config, row));
        }

        request.skip += request.top;
        if u64::from(request.skip) >= total_records {
            break;
        }
    }

    let elapsed = started.elapsed();
    debug!(module, metric, results = total_records, "fetched {} results", total_records);

    state
        .metrics
        .query_time
        .with_label_values(&[module, metric])
        .observe(elapsed.as_secs_f64());
    state
        .metrics
        .query_results
        .with_label_values(&[module, metric])
        .set(total_records as f64);

    Ok(())
}

/// Renders a metric list as Prometheus gauges
///
/// Every family becomes one gauge vector over the union of its label names.
/// Rows without a value are skipped. A family whose name or labels are not
/// valid Prometheus identifiers is logged and left out.
pub fn render_metric_list(list: &MetricList) -> Result<String, ProbeError> {
    let registry = Registry::new();

    for name in list.metric_names() {
        let label_names = list.label_names(name);
        let label_refs: Vec<&str> = label_names.iter().map(String::as_str).collect();

        let gauge = match GaugeVec::new(Opts::new(name, name), &label_refs)
            .and_then(|gauge| registry.register(Box::new(gauge.clone())).map(|_| gauge))
        {
            Ok(gauge) => gauge,
            Err(err) => {
                warn!(metric = name, "skipping metric family: {}", err);
                continue;
            }
        };

        for row in list.padded_rows(name) {
            let Some(value) = row.value else {
                debug!(metric = name, labels = ?row.labels, "skipping row without value");
                continue;
            };

            let values: Vec<&str> = row.labels.values().map(String::as_str).collect();
            match gauge.get_metric_with_label_values(&values) {
                Ok(sample) => sample.set(value),
                Err(err) => warn!(metric = name, "skipping row: {}", err),
            }
        }
    }

    Ok(encode_text(&registry)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ProbeCache;
    use crate::config::Config;
    use crate::metrics::MetricRow;
    use crate::source::{QueryExecutor, QueryPage};
    use crate::telemetry::ExporterMetrics;
    use crate::value::{Row, RowValue};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Serves a fixed result set page by page
    struct StubExecutor {
        rows: Vec<Row>,
        calls: AtomicUsize,
        requests: Mutex<Vec<QueryRequest>>,
        fail: bool,
        delay: Duration,
    }

    impl StubExecutor {
        fn new(rows: Vec<Row>) -> Self {
            StubExecutor {
                rows,
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
                fail: false,
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl QueryExecutor for StubExecutor {
        async fn execute(&self, request: &QueryRequest) -> Result<QueryPage, QueryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
            tokio::time::sleep(self.delay).await;

            if self.fail {
                return Err(QueryError::Status {
                    status: 403,
                    body: "forbidden".to_string(),
                });
            }

            let rows = self
                .rows
                .iter()
                .skip(request.skip as usize)
                .take(request.top as usize)
                .cloned()
                .collect();

            Ok(QueryPage {
                total_records: self.rows.len() as u64,
                rows,
                quota_remaining: Some(11),
            })
        }
    }

    const CONFIG: &str = r#"
queries:
  - metric: azurerm_resource
    module: resources
    query: Resources
    value: 1
    subscriptions: [sub-override]
    fields:
      - name: id
        type: id
      - name: count
        type: value
    defaultField:
      type: ignore
  - metric: azurerm_other
    module: other
    query: Other
    value: 1
"#;

    fn resource_row(index: usize) -> Row {
        let mut row = Row::new();
        row.insert("id".to_string(), RowValue::String(format!("res-{}", index)));
        row.insert("count".to_string(), RowValue::Int(index as i64));
        row.insert("location".to_string(), RowValue::String("westeurope".to_string()));
        row
    }

    fn state_with(executor: Arc<StubExecutor>) -> AppState {
        let mut config = Config::from_yaml(CONFIG).unwrap();
        config.validate().unwrap();

        AppState {
            config: Arc::new(config),
            executor,
            subscriptions: vec!["sub-default".to_string()],
            cache: Arc::new(ProbeCache::new()),
            metrics: ExporterMetrics::new().unwrap(),
        }
    }

    fn params(module: &str, cache: Option<&str>) -> ProbeParams {
        ProbeParams {
            module: module.to_string(),
            cache: cache.map(str::to_string),
        }
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("300s"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h 30m"), Ok(Duration::from_secs(5400)));
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("0"), Ok(Duration::ZERO));

        for invalid in ["", "5", "m", "5x", "-5m", "five minutes"] {
            assert_eq!(
                parse_duration(invalid),
                Err(InvalidDuration(invalid.to_string())),
                "{}",
                invalid
            );
        }
    }

    #[test]
    fn test_render_pads_labels_and_skips_absent_values() {
        let mut list = MetricList::new();
        let mut first = MetricRow::new();
        first.labels.insert("id".to_string(), "a".to_string());
        first.value = Some(1.0);
        let mut second = MetricRow::new();
        second.labels.insert("scope".to_string(), "one".to_string());
        second.value = Some(2.0);
        let mut absent = MetricRow::new();
        absent.labels.insert("id".to_string(), "c".to_string());
        list.add("azure_testing", [first, second, absent]);

        let output = render_metric_list(&list).unwrap();

        assert!(output.contains("# TYPE azure_testing gauge"));
        assert!(output.contains("azure_testing{id=\"a\",scope=\"\"} 1"));
        assert!(output.contains("azure_testing{id=\"\",scope=\"one\"} 2"));
        assert!(!output.contains("id=\"c\""));
    }

    #[test]
    fn test_render_skips_invalid_family() {
        let mut list = MetricList::new();
        let mut valid = MetricRow::new();
        valid.value = Some(3.0);
        list.add("azure-invalid name", [valid.clone()]);
        list.add("azure_valid", [valid]);

        let output = render_metric_list(&list).unwrap();

        assert!(output.contains("azure_valid 3"));
        assert!(!output.contains("azure-invalid"));
    }

    #[tokio::test]
    async fn test_probe_pages_through_results() {
        let rows = (0..2500).map(resource_row).collect();
        let executor = Arc::new(StubExecutor::new(rows));
        let state = state_with(Arc::clone(&executor));

        let outcome = probe(&state, &params("resources", None)).await.unwrap();

        assert!(!outcome.cached);
        assert!(outcome.cached_until.is_none());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);

        let requests = executor.requests.lock().unwrap().clone();
        let skips: Vec<u32> = requests.iter().map(|request| request.skip).collect();
        assert_eq!(skips, vec![0, 1000, 2000]);
        assert!(requests.iter().all(|request| request.top == QUERY_PAGE_SIZE));
        assert_eq!(requests[0].subscriptions, vec!["sub-override".to_string()]);

        assert!(outcome.body.contains("azurerm_resource{id=\"res-0\"} 0"));
        assert!(outcome.body.contains("azurerm_resource{id=\"res-2499\"} 2499"));
        assert!(!outcome.body.contains("westeurope"));

        let telemetry = state.metrics.render().unwrap();
        assert!(telemetry.contains(
            "azure_resourcegraph_query_request_count{metric=\"azurerm_resource\",module=\"resources\"} 3"
        ));
        assert!(telemetry.contains(
            "azure_resourcegraph_query_results{metric=\"azurerm_resource\",module=\"resources\"} 2500"
        ));
        assert!(telemetry.contains("azure_resourcegraph_ratelimit 11"));
    }

    #[tokio::test]
    async fn test_probe_uses_default_subscriptions_and_stops_on_empty_page() {
        let executor = Arc::new(StubExecutor::new(Vec::new()));
        let state = state_with(Arc::clone(&executor));

        let outcome = probe(&state, &params("other", None)).await.unwrap();

        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            executor.requests.lock().unwrap()[0].subscriptions,
            vec!["sub-default".to_string()]
        );
        assert!(!outcome.body.contains("azurerm_other"));
    }

    #[tokio::test]
    async fn test_probe_unknown_module_runs_nothing() {
        let executor = Arc::new(StubExecutor::new(vec![resource_row(1)]));
        let state = state_with(Arc::clone(&executor));

        let outcome = probe(&state, &params("missing", None)).await.unwrap();

        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
        assert!(outcome.body.is_empty());
    }

    #[tokio::test]
    async fn test_probe_cache() {
        let executor = Arc::new(StubExecutor::new(vec![resource_row(7)]));
        let state = state_with(Arc::clone(&executor));

        let first = probe(&state, &params("resources", Some("5m"))).await.unwrap();
        assert!(!first.cached);
        assert!(first.cached_until.is_some_and(|until| until > Utc::now()));

        let second = probe(&state, &params("resources", Some("5m"))).await.unwrap();
        assert!(second.cached);
        assert!(second.cached_until.is_none());
        assert_eq!(second.body, first.body);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

        // no cache parameter always queries
        let third = probe(&state, &params("resources", None)).await.unwrap();
        assert!(!third.cached);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_cached_probes_build_once() {
        let mut stub = StubExecutor::new(vec![resource_row(3)]);
        stub.delay = Duration::from_millis(50);
        let executor = Arc::new(stub);
        let state = state_with(Arc::clone(&executor));
        let cached = params("resources", Some("5m"));

        let (first, second) = tokio::join!(probe(&state, &cached), probe(&state, &cached));
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert!(first.cached != second.cached);
        assert_eq!(first.body, second.body);
    }

    #[tokio::test]
    async fn test_module_without_queries_is_not_cached() {
        let executor = Arc::new(StubExecutor::new(Vec::new()));
        let state = state_with(Arc::clone(&executor));

        for _ in 0..2 {
            let outcome = probe(&state, &params("missing", Some("5m"))).await.unwrap();
            assert!(!outcome.cached);
            assert!(outcome.cached_until.is_none());
        }
        assert!(state.cache.get("cache:missing").await.is_none());
    }

    #[tokio::test]
    async fn test_cache_duration_is_capped() {
        let executor = Arc::new(StubExecutor::new(vec![resource_row(1)]));
        let state = state_with(Arc::clone(&executor));

        let err = probe(&state, &params("resources", Some("5000000000000000h")))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::CacheDurationTooLong(_)));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);

        let outcome = probe(&state, &params("resources", Some("7days"))).await.unwrap();
        assert!(outcome.cached_until.is_some());
    }

    #[tokio::test]
    async fn test_probe_invalid_cache_duration() {
        let executor = Arc::new(StubExecutor::new(Vec::new()));
        let state = state_with(Arc::clone(&executor));

        let err = probe(&state, &params("resources", Some("five minutes")))
            .await
            .unwrap_err();

        assert!(matches!(err, ProbeError::InvalidCacheDuration(_)));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_probe_query_failure() {
        let mut stub = StubExecutor::new(Vec::new());
        stub.fail = true;
        let state = state_with(Arc::new(stub));

        let err = probe(&state, &params("resources", None)).await.unwrap_err();

        assert_eq!(
            err.to_string(),
            "query \"azurerm_resource\": query API returned status 403: forbidden"
        );
    }
}
