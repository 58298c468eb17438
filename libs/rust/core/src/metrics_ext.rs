//! Metric instrument groups for routing, pipeline, aggregation, lifecycle and inference.
//!
//! Instruments bind to the global meter provider on first use, so `init_metrics` must run
//! before the first access for them to be exported.

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};

pub struct RoutingMetrics {
    pub decisions_total: Counter<u64>,
    pub no_active_total: Counter<u64>,
    pub route_latency_ms: Histogram<f64>,
    pub active_weight: Gauge<f64>,
}

pub struct PipelineMetrics {
    pub published_total: Counter<u64>,
    pub delivered_total: Counter<u64>,
    pub dropped_total: Counter<u64>,
    pub decode_errors_total: Counter<u64>,
}

pub struct AggregatorMetrics {
    pub ingested_total: Counter<u64>,
    pub duplicates_total: Counter<u64>,
    pub feedback_total: Counter<u64>,
    pub insufficient_samples_total: Counter<u64>,
    pub evicted_ids_total: Counter<u64>,
}

pub struct LifecycleMetrics {
    pub cycles_total: Counter<u64>,
    pub transitions_total: Counter<u64>,
    pub transition_failures_total: Counter<u64>,
    pub cycle_latency_ms: Histogram<f64>,
}

pub struct WorkerMetrics {
    pub predictions_total: Counter<u64>,
    pub prediction_errors_total: Counter<u64>,
    pub timeouts_total: Counter<u64>,
    pub prediction_latency_ms: Histogram<f64>,
    pub load_latency_ms: Histogram<f64>,
    pub load_errors_total: Counter<u64>,
    pub unloads_total: Counter<u64>,
    pub cost_total: Counter<f64>,
}

pub struct ResilienceMetrics {
    pub retries_total: Counter<u64>,
    pub breaker_open_total: Counter<u64>,
    pub breaker_rejections_total: Counter<u64>,
}

pub struct ServingMetrics {
    pub routing: RoutingMetrics,
    pub pipeline: PipelineMetrics,
    pub aggregator: AggregatorMetrics,
    pub lifecycle: LifecycleMetrics,
    pub worker: WorkerMetrics,
    pub resilience: ResilienceMetrics,
}

static SERVING_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("predictor_serving"));

pub static SERVING_METRICS: Lazy<ServingMetrics> = Lazy::new(|| {
    let m = &*SERVING_METER;
    ServingMetrics {
        routing: RoutingMetrics {
            decisions_total: m
                .u64_counter("serving_routing_decisions_total")
                .with_description("Requests assigned to a predictor")
                .build(),
            no_active_total: m
                .u64_counter("serving_routing_no_active_total")
                .with_description("Requests rejected because no deployment was active")
                .build(),
            route_latency_ms: m
                .f64_histogram("serving_routing_latency_ms")
                .with_description("Time to resolve a routing decision")
                .with_unit("ms")
                .build(),
            active_weight: m
                .f64_gauge("serving_deployment_weight")
                .with_description("Traffic weight of active deployments")
                .build(),
        },
        pipeline: PipelineMetrics {
            published_total: m
                .u64_counter("serving_pipeline_published_total")
                .with_description("Payloads published per topic")
                .build(),
            delivered_total: m
                .u64_counter("serving_pipeline_delivered_total")
                .with_description("Payload deliveries to subscribers")
                .build(),
            dropped_total: m
                .u64_counter("serving_pipeline_dropped_total")
                .with_description("Deliveries lost to disconnected subscribers")
                .build(),
            decode_errors_total: m
                .u64_counter("serving_pipeline_decode_errors_total")
                .with_description("Remote payloads that failed to decode")
                .build(),
        },
        aggregator: AggregatorMetrics {
            ingested_total: m
                .u64_counter("serving_aggregator_ingested_total")
                .with_description("Prediction results applied to snapshots")
                .build(),
            duplicates_total: m
                .u64_counter("serving_aggregator_duplicates_total")
                .with_description("Redelivered results ignored")
                .build(),
            feedback_total: m
                .u64_counter("serving_aggregator_feedback_total")
                .with_description("Late outcome feedback applied")
                .build(),
            insufficient_samples_total: m
                .u64_counter("serving_aggregator_insufficient_samples_total")
                .with_description("Comparisons deferred for lack of samples")
                .build(),
            evicted_ids_total: m
                .u64_counter("serving_aggregator_evicted_ids_total")
                .with_description("Dedup cache entries evicted")
                .build(),
        },
        lifecycle: LifecycleMetrics {
            cycles_total: m
                .u64_counter("serving_lifecycle_cycles_total")
                .with_description("Controller poll cycles")
                .build(),
            transitions_total: m
                .u64_counter("serving_lifecycle_transitions_total")
                .with_description("Deployment transitions applied by the controller")
                .build(),
            transition_failures_total: m
                .u64_counter("serving_lifecycle_transition_failures_total")
                .with_description("Transitions that failed and will be retried")
                .build(),
            cycle_latency_ms: m
                .f64_histogram("serving_lifecycle_cycle_latency_ms")
                .with_description("Controller cycle duration")
                .with_unit("ms")
                .build(),
        },
        worker: WorkerMetrics {
            predictions_total: m
                .u64_counter("serving_worker_predictions_total")
                .with_description("Predictions produced")
                .build(),
            prediction_errors_total: m
                .u64_counter("serving_worker_prediction_errors_total")
                .with_description("Predictions that failed")
                .build(),
            timeouts_total: m
                .u64_counter("serving_worker_timeouts_total")
                .with_description("Requests whose result missed the deadline")
                .build(),
            prediction_latency_ms: m
                .f64_histogram("serving_worker_prediction_latency_ms")
                .with_description("Predictor call latency")
                .with_unit("ms")
                .build(),
            load_latency_ms: m
                .f64_histogram("serving_worker_load_latency_ms")
                .with_description("Predictor load latency")
                .with_unit("ms")
                .build(),
            load_errors_total: m
                .u64_counter("serving_worker_load_errors_total")
                .with_description("Predictor loads that failed")
                .build(),
            unloads_total: m
                .u64_counter("serving_worker_unloads_total")
                .with_description("Idle predictors unloaded")
                .build(),
            cost_total: m
                .f64_counter("serving_worker_cost_total")
                .with_description("Accumulated prediction cost")
                .build(),
        },
        resilience: ResilienceMetrics {
            retries_total: m
                .u64_counter("serving_resilience_retries_total")
                .with_description("Retry attempts after a failure")
                .build(),
            breaker_open_total: m
                .u64_counter("serving_resilience_breaker_open_total")
                .with_description("Circuit breaker transitions to open")
                .build(),
            breaker_rejections_total: m
                .u64_counter("serving_resilience_breaker_rejections_total")
                .with_description("Calls short-circuited by an open breaker")
                .build(),
        },
    }
});
