//! Output module for crawl progress reporting
//!
//! This module handles loading task and record counts from storage and
//! printing them for the `stats` command and at the end of a run.

pub mod stats;

pub use stats::{load_statistics, print_statistics, render_statistics, RunStatistics};
