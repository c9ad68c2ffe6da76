//! Core data model shared by the stores, the work queue and the crawler
//!
//! - `Record`: one extracted listing, keyed by its natural identity
//! - `Task`: one page of crawl work with its lifecycle flags
//! - `TaskResult`: the outcome of processing one task

mod record;
mod task;

pub use record::Record;
pub use task::{Task, TaskResult, TaskStatus};
