use chrono::{DateTime, Utc};

/// Source of "now" for everything time-dependent (turn deadlines, event timestamps)
pub trait ClockPort: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}
