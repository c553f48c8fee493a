pub mod detector;
pub mod gaps;
pub mod monitor;

pub use detector::{HealthAlert, HealthDetector, HealthLevel, HealthStatus};
pub use gaps::{detect_gaps, TimeWindow};
pub use monitor::HealthMonitor;
