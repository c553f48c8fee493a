pub mod ids;
pub mod line;
pub mod timestamp;

pub use ids::{CycleId, RunId};
pub use line::{LineValue, Quote};
pub use timestamp::{Clock, ManualClock, SystemClock, Timestamp};
