/// Task lifecycle definitions
///
/// A task is one page number worth of crawl work. Its state is stored as two
/// independent flags and interpreted as a three-value status.
use crate::model::Record;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status derived from a task's `in_work` and `completed` flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Not claimed and not completed; eligible for a claim
    Idle,

    /// Claimed by a dispatcher and not yet completed
    InProgress,

    /// Completed; terminal, never left again
    Done,
}

impl TaskStatus {
    /// Derives the status from the stored flags
    ///
    /// `in_work` is irrelevant once a task is completed.
    pub fn from_flags(in_work: bool, completed: bool) -> Self {
        match (in_work, completed) {
            (_, true) => Self::Done,
            (true, false) => Self::InProgress,
            (false, false) => Self::Idle,
        }
    }

    /// Returns true if the task can never change state again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Short lowercase label used in logs and the `stats` output
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::InProgress => "in_progress",
            Self::Done => "done",
        }
    }

    /// Parses a label produced by [`TaskStatus::as_str`]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "in_progress" => Some(Self::InProgress),
            "done" => Some(Self::Done),
            _ => None,
        }
    }

    pub const ALL: [TaskStatus; 3] = [Self::Idle, Self::InProgress, Self::Done];
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One unit of crawl work: a single listing page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Task {
    /// Store-assigned id
    pub id: i64,

    /// Positive, 1-based page number
    pub page_number: u32,

    pub in_work: bool,
    pub completed: bool,
}

impl Task {
    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_flags(self.in_work, self.completed)
    }
}

/// Outcome of processing one task
///
/// A result retires its task to DONE whether or not any of its records end up stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskResult {
    pub task_id: i64,
    pub page_number: u32,

    /// Records extracted from the page; may be empty
    pub records: Vec<Record>,

    /// The listing page had no listings left, so later pages need not be dispatched
    #[serde(default)]
    pub listings_exhausted: bool,
}

impl TaskResult {
    /// A result for a task whose page yielded nothing
    pub fn empty(task: &Task) -> Self {
        Self {
            task_id: task.id,
            page_number: task.page_number,
            records: Vec::new(),
            listings_exhausted: false,
        }
    }

    /// A result for a listing page that reported no more listings
    pub fn exhausted(task: &Task) -> Self {
        Self {
            listings_exhausted: true,
            ..Self::empty(task)
        }
    }
}
