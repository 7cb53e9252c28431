//! Metrics definitions for the delivery engine.

use shared::metrics_defs::{MetricDef, MetricType};

pub const PUSH_RECEIVED: MetricDef = MetricDef {
    name: "push.received",
    metric_type: MetricType::Counter,
    description: "Number of pushes accepted by the router",
};

pub const PUSH_PROCESSED: MetricDef = MetricDef {
    name: "push.processed",
    metric_type: MetricType::Counter,
    description: "Number of device sends that succeeded",
};

pub const PUSH_FAILED: MetricDef = MetricDef {
    name: "push.failed",
    metric_type: MetricType::Counter,
    description: "Number of device sends that failed",
};

pub const PUSH_IO_DURATION: MetricDef = MetricDef {
    name: "push.io.duration",
    metric_type: MetricType::Histogram,
    description: "Time spent in a provider call in seconds",
};

pub const PUSH_INFLIGHT: MetricDef = MetricDef {
    name: "push.inflight",
    metric_type: MetricType::Gauge,
    description: "Number of pushes holding a dispatcher slot",
};

pub const ALL_METRICS: &[MetricDef] = &[
    PUSH_RECEIVED,
    PUSH_PROCESSED,
    PUSH_FAILED,
    PUSH_IO_DURATION,
    PUSH_INFLIGHT,
];
