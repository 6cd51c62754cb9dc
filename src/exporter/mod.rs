mod collector;
mod metric;
mod quantile;
mod runner;

pub use metric::http_server;
pub use metric::{Instruments, MetricIdentity};
pub use runner::{spawn_monitor, Monitor};
