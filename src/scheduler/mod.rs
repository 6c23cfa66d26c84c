// 批量调度模块

pub mod batch;
pub mod plan;

pub use batch::{BatchCounters, BatchReport, BatchScheduler};
pub use plan::{plan_downloads, plan_uploads, BatchOptions, Destinations, SHUFFLE_SEED};
