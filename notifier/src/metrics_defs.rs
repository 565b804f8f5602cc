//! Metrics definitions for the notifier.

use shared::metrics_defs::{MetricDef, MetricType};

pub const LONG_POLL_IMMEDIATE: MetricDef = MetricDef {
    name: "long_poll.immediate",
    metric_type: MetricType::Counter,
    description: "Polls answered without parking because a newer message already existed",
};

pub const LONG_POLL_REGISTERED: MetricDef = MetricDef {
    name: "long_poll.registered",
    metric_type: MetricType::Counter,
    description: "Polls parked in the notification registry",
};

pub const LONG_POLL_FULFILLED: MetricDef = MetricDef {
    name: "long_poll.fulfilled",
    metric_type: MetricType::Counter,
    description: "Parked polls resolved by a release message",
};

pub const LONG_POLL_TIMED_OUT: MetricDef = MetricDef {
    name: "long_poll.timed_out",
    metric_type: MetricType::Counter,
    description: "Parked polls that reached their deadline without a change",
};

pub const LONG_POLL_CANCELLED: MetricDef = MetricDef {
    name: "long_poll.cancelled",
    metric_type: MetricType::Counter,
    description: "Parked polls abandoned because the client disconnected",
};

pub const LONG_POLL_PARKED: MetricDef = MetricDef {
    name: "long_poll.parked",
    metric_type: MetricType::Gauge,
    description: "Number of polls currently parked",
};

pub const RELEASE_MESSAGE_RECEIVED: MetricDef = MetricDef {
    name: "release_message.received",
    metric_type: MetricType::Counter,
    description: "Release messages handed to the bus",
};

pub const RELEASE_MESSAGE_INVALID: MetricDef = MetricDef {
    name: "release_message.invalid",
    metric_type: MetricType::Counter,
    description: "Release messages dropped because the content is malformed",
};

pub const NOTIFICATION_BATCH_ASYNC: MetricDef = MetricDef {
    name: "notification.batch.async",
    metric_type: MetricType::Counter,
    description: "Fan-outs large enough to be handed to the delivery workers",
};

pub const NOTIFICATION_FANOUT_SIZE: MetricDef = MetricDef {
    name: "notification.fanout.size",
    metric_type: MetricType::Histogram,
    description: "Number of parked polls woken by a single release message",
};

pub const SCANNER_ERRORS: MetricDef = MetricDef {
    name: "scanner.errors",
    metric_type: MetricType::Counter,
    description: "Failed reads of the release message log",
};

pub const INSTANCE_CACHE_HIT: MetricDef = MetricDef {
    name: "instance_cache.hit",
    metric_type: MetricType::Counter,
    description: "Activity queries that found a recent poll",
};

pub const INSTANCE_CACHE_MISS: MetricDef = MetricDef {
    name: "instance_cache.miss",
    metric_type: MetricType::Counter,
    description: "Activity queries without a recent poll",
};

pub const NOTIFICATION_QUEUE_FULL: MetricDef = MetricDef {
    name: "notification.queue_full",
    metric_type: MetricType::Counter,
    description: "Large fan-outs delivered inline because the delivery queue was full",
};

pub const ALL_METRICS: &[MetricDef] = &[
    LONG_POLL_IMMEDIATE,
    LONG_POLL_REGISTERED,
    LONG_POLL_FULFILLED,
    LONG_POLL_TIMED_OUT,
    LONG_POLL_CANCELLED,
    LONG_POLL_PARKED,
    RELEASE_MESSAGE_RECEIVED,
    RELEASE_MESSAGE_INVALID,
    NOTIFICATION_BATCH_ASYNC,
    NOTIFICATION_FANOUT_SIZE,
    NOTIFICATION_QUEUE_FULL,
    SCANNER_ERRORS,
    INSTANCE_CACHE_HIT,
    INSTANCE_CACHE_MISS,
];
