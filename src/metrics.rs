//! Metrics and tracing helpers
//!
//! With the `metrics` feature, [`METRICS`] records query timings and the ledger and gate-pass
//! counters through OpenTelemetry into a Prometheus registry; [`render`] produces the text
//! exposition for whatever HTTP layer serves `/metrics`. With the `tracing` feature,
//! [`tracing_helpers`] builds the spans used around queries, transactions, pickups and sweeps.

#[cfg(feature = "metrics")]
pub use self::prometheus_metrics::{render, ColdstoreMetrics, METRICS};

#[cfg(feature = "metrics")]
mod prometheus_metrics {
    use once_cell::sync::Lazy;
    use opentelemetry::metrics::{Counter, Histogram, MeterProvider as _};
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use prometheus::{Encoder, Registry, TextEncoder};
    use std::time::Duration;

    pub static METRICS: Lazy<ColdstoreMetrics> = Lazy::new(ColdstoreMetrics::init);

    pub struct ColdstoreMetrics {
        registry: Registry,
        _provider: Option<SdkMeterProvider>,
        queries_total: Counter<u64>,
        query_errors_total: Counter<u64>,
        query_duration: Histogram<f64>,
        connection_wait: Histogram<f64>,
        transitions_total: Counter<u64>,
        pickups_total: Counter<u64>,
        pickup_conflicts_total: Counter<u64>,
        units_picked_total: Counter<u64>,
        expired_total: Counter<u64>,
    }

    impl ColdstoreMetrics {
        pub fn init() -> Self {
            let registry = Registry::new();
            // A failed exporter leaves the meters recording into a provider with no reader.
            let provider = match opentelemetry_prometheus::exporter()
                .with_registry(registry.clone())
                .build()
            {
                Ok(exporter) => Some(SdkMeterProvider::builder().with_reader(exporter).build()),
                Err(e) => {
                    log::warn!("prometheus exporter unavailable, metrics will not be exported: {e}");
                    None
                }
            };
            let meter = match &provider {
                Some(provider) => provider.meter("coldstore"),
                None => opentelemetry::global::meter("coldstore"),
            };

            Self {
                registry,
                queries_total: meter
                    .u64_counter("coldstore_queries_total")
                    .with_description("Total queries executed")
                    .build(),
                query_errors_total: meter
                    .u64_counter("coldstore_query_errors_total")
                    .with_description("Queries that returned an error")
                    .build(),
                query_duration: meter
                    .f64_histogram("coldstore_query_duration_seconds")
                    .with_description("Duration of queries")
                    .build(),
                connection_wait: meter
                    .f64_histogram("coldstore_connection_wait_seconds")
                    .with_description("Time spent establishing connections")
                    .build(),
                transitions_total: meter
                    .u64_counter("coldstore_gate_pass_transitions_total")
                    .with_description("Gate pass status transitions by target status")
                    .build(),
                pickups_total: meter
                    .u64_counter("coldstore_pickups_total")
                    .with_description("Pickups applied against the ledger")
                    .build(),
                pickup_conflicts_total: meter
                    .u64_counter("coldstore_pickup_conflicts_total")
                    .with_description("Pickups refused by state or stock guards")
                    .build(),
                units_picked_total: meter
                    .u64_counter("coldstore_units_picked_total")
                    .with_description("Units withdrawn from storage")
                    .build(),
                expired_total: meter
                    .u64_counter("coldstore_gate_passes_expired_total")
                    .with_description("Gate passes expired by the sweeper")
                    .build(),
                _provider: provider,
            }
        }

        pub fn record_query_duration(&self, elapsed: Duration) {
            self.queries_total.add(1, &[]);
            self.query_duration.record(elapsed.as_secs_f64(), &[]);
        }

        pub fn record_query_error(&self) {
            self.query_errors_total.add(1, &[]);
        }

        pub fn record_connection_wait(&self, elapsed: Duration) {
            self.connection_wait.record(elapsed.as_secs_f64(), &[]);
        }

        pub fn record_transition(&self, status: &'static str) {
            self.transitions_total
                .add(1, &[KeyValue::new("status", status)]);
        }

        pub fn record_pickup(&self, quantity: i64) {
            self.pickups_total.add(1, &[]);
            self.units_picked_total
                .add(u64::try_from(quantity).unwrap_or(0), &[]);
        }

        pub fn record_pickup_conflict(&self) {
            self.pickup_conflicts_total.add(1, &[]);
        }

        pub fn record_expired(&self, count: usize) {
            self.expired_total.add(count as u64, &[]);
        }
    }

    /// Prometheus text exposition of everything recorded so far.
    pub fn render() -> String {
        let mut buffer = Vec::new();
        let families = METRICS.registry.gather();
        if let Err(e) = TextEncoder::new().encode(&families, &mut buffer) {
            log::warn!("failed to encode metrics: {e}");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::{info_span, Span};

    pub fn execute_query_span(query: &str) -> Span {
        info_span!("coldstore.query", db.statement = %query)
    }

    pub fn acquire_connection_span() -> Span {
        info_span!("coldstore.acquire_connection")
    }

    pub fn begin_transaction_span() -> Span {
        info_span!("coldstore.transaction.begin")
    }

    pub fn commit_transaction_span() -> Span {
        info_span!("coldstore.transaction.commit")
    }

    pub fn rollback_transaction_span() -> Span {
        info_span!("coldstore.transaction.rollback")
    }

    pub fn pickup_span(gate_pass_id: &uuid::Uuid, quantity: i64) -> Span {
        info_span!("coldstore.pickup", gate_pass.id = %gate_pass_id, quantity)
    }

    pub fn sweep_span() -> Span {
        info_span!("coldstore.sweep")
    }
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::*;

    #[test]
    fn test_counters_show_up_in_exposition() {
        METRICS.record_pickup(150);
        METRICS.record_transition("completed");
        METRICS.record_expired(2);
        let text = render();
        assert!(text.contains("coldstore_pickups_total"), "{text}");
        assert!(text.contains("coldstore_gate_pass_transitions_total"), "{text}");
    }
}
