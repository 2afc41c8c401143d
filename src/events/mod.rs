//! Monitor event bus

mod bus;

pub use bus::{
    ContainerSnapshot, ContainerState, EventBus, HostStatus, MetricKind, MetricSample,
    MonitorEvent, OfflineReason,
};
