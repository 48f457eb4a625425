pub mod candles;
pub mod connection_sync;
pub mod dispatcher;
pub mod farm;
pub mod health;
pub mod lifecycle;
pub mod metrics;
pub mod rate_limiter;
pub mod reconciler;

pub use candles::CandleQueue;
pub use connection_sync::ConnectionSync;
pub use dispatcher::CommandDispatcher;
pub use farm::TerminalFarm;
pub use health::{compute_health, FleetHealth, HealthStatus, HealthThresholds, TerminalHealth};
pub use lifecycle::{OrchestratorDirective, TerminalLifecycle, TerminalStatusView};
pub use metrics::{Metrics, MetricsSnapshot, SyncMetrics};
pub use rate_limiter::SyncRateLimiter;
pub use reconciler::TradeReconciler;
