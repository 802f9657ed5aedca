//! Infrastructure layer: task persistence and broker adapters.

pub mod broker;
pub mod store;

pub use broker::{
    BrokerError, BrokerHandle, BrokerJob, BrokerTaskState, ExecutionBroker, InProcessBroker,
    RoutingOptions, WorkerStats,
};
pub use store::{
    AnalyticsSummary, Dependency, DependencyView, ExecutionLogEntry, HourlyBucket, InMemoryTaskStore,
    LogLevel, Metric, PostgresTaskStore, StatusHistoryEntry, TaskFilter, TaskStore, TaskStoreError,
    WorkerAssignment, WorkerPerformance,
};
