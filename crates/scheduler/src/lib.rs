pub mod clock;
pub mod job;
pub mod scheduler;
pub mod trigger;

pub use clock::{Clock, ManualClock, SystemClock};
pub use job::{FireOutcome, Firing, JobInfo, JobSpec, JobWork, OverlapPolicy};
pub use scheduler::Scheduler;
pub use trigger::{CronExpr, FireSchedule, Trigger};
