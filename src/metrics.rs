//! Query metrics (feature `metrics`) and tracing span helpers (feature `tracing`).
//!
//! Metrics go through OpenTelemetry into a private `prometheus::Registry`;
//! [`gather`] renders them in the text exposition format.

#[cfg(feature = "metrics")]
pub use self::otel::{gather, UndertowMetrics, METRICS};

#[cfg(feature = "metrics")]
mod otel {
    use std::time::Duration;

    use once_cell::sync::Lazy;
    use opentelemetry::{
        global,
        metrics::{Counter, Histogram, MeterProvider},
    };
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use prometheus::{Encoder, TextEncoder};

    pub static METRICS: Lazy<UndertowMetrics> = Lazy::new(UndertowMetrics::init);

    pub struct UndertowMetrics {
        registry: prometheus::Registry,
        _provider: Option<SdkMeterProvider>,
        pub queries_total: Counter<u64>,
        pub query_errors_total: Counter<u64>,
        pub query_duration: Histogram<f64>,
        pub connection_wait: Histogram<f64>,
        pub rows_hydrated: Counter<u64>,
    }

    impl UndertowMetrics {
        pub fn init() -> Self {
            let registry = prometheus::Registry::new();
            let provider = match opentelemetry_prometheus::exporter()
                .with_registry(registry.clone())
                .build()
            {
                Ok(exporter) => Some(SdkMeterProvider::builder().with_reader(exporter).build()),
                Err(err) => {
                    log::error!("prometheus exporter unavailable, metrics disabled: {}", err);
                    None
                }
            };
            let meter = match &provider {
                Some(provider) => provider.meter("undertow"),
                None => global::meter("undertow"),
            };

            let queries_total = meter
                .u64_counter("undertow_queries_total")
                .with_description("Total statements executed")
                .build();

            let query_errors_total = meter
                .u64_counter("undertow_query_errors_total")
                .with_description("Statements rejected by the backend")
                .build();

            let query_duration = meter
                .f64_histogram("undertow_query_duration_seconds")
                .with_description("Duration of statements")
                .build();

            let connection_wait = meter
                .f64_histogram("undertow_connection_wait_seconds")
                .with_description("Time spent waiting for a pooled connection")
                .build();

            let rows_hydrated = meter
                .u64_counter("undertow_rows_hydrated_total")
                .with_description("Rows turned into records")
                .build();

            Self {
                registry,
                _provider: provider,
                queries_total,
                query_errors_total,
                query_duration,
                connection_wait,
                rows_hydrated,
            }
        }

        pub fn record_query(&self, elapsed: Duration) {
            self.queries_total.add(1, &[]);
            self.query_duration.record(elapsed.as_secs_f64(), &[]);
        }

        pub fn record_query_error(&self) {
            self.query_errors_total.add(1, &[]);
        }

        pub fn record_connection_wait(&self, elapsed: Duration) {
            self.connection_wait.record(elapsed.as_secs_f64(), &[]);
        }

        pub fn record_rows_hydrated(&self, rows: usize) {
            self.rows_hydrated.add(rows as u64, &[]);
        }
    }

    /// Prometheus text exposition of every undertow metric.
    pub fn gather() -> String {
        let families = METRICS.registry.gather();
        let mut buf = Vec::new();
        if let Err(err) = TextEncoder::new().encode(&families, &mut buf) {
            log::warn!("failed to encode metrics: {}", err);
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::{info_span, Span};

    pub fn execute_query_span(sql: &str) -> Span {
        info_span!("undertow.execute_query", db.statement = %sql)
    }

    pub fn acquire_connection_span(alias: &str) -> Span {
        info_span!("undertow.acquire_connection", db.alias = %alias)
    }

    pub fn transaction_span(alias: &str) -> Span {
        info_span!("undertow.transaction", db.alias = %alias)
    }

    pub fn prefetch_span(lookup: &str) -> Span {
        info_span!("undertow.prefetch", relation = %lookup)
    }
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_recorded_query_is_exported() {
        METRICS.record_query(Duration::from_millis(3));
        METRICS.record_rows_hydrated(2);
        let text = gather();
        assert!(text.contains("undertow_queries_total"));
    }
}
