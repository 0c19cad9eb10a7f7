pub mod engine;

pub use engine::{FollowupTrigger, SchedulerEngine};
