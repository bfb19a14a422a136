//! Run states and the record of one run's progress through them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;

/// Where a run is. The main path visits every non-terminal state in
/// declaration order; `Failed` is reachable from any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Pending,
    Fetching,
    PublishingRaw,
    Reading,
    Transforming,
    Writing,
    PublishingProcessed,
    Loading,
    Done,
    Failed,
}

impl RunState {
    /// Metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Fetching => "fetching",
            RunState::PublishingRaw => "publishing_raw",
            RunState::Reading => "reading",
            RunState::Transforming => "transforming",
            RunState::Writing => "writing",
            RunState::PublishingProcessed => "publishing_processed",
            RunState::Loading => "loading",
            RunState::Done => "done",
            RunState::Failed => "failed",
        }
    }

    /// The state that follows a successful stage, `None` once terminal.
    pub fn next(&self) -> Option<RunState> {
        match self {
            RunState::Pending => Some(RunState::Fetching),
            RunState::Fetching => Some(RunState::PublishingRaw),
            RunState::PublishingRaw => Some(RunState::Reading),
            RunState::Reading => Some(RunState::Transforming),
            RunState::Transforming => Some(RunState::Writing),
            RunState::Writing => Some(RunState::PublishingProcessed),
            RunState::PublishingProcessed => Some(RunState::Loading),
            RunState::Loading => Some(RunState::Done),
            RunState::Done | RunState::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_ascii_uppercase())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: RunState,
    pub to: RunState,
    pub at: DateTime<Utc>,
}

/// Files and objects produced so far. Fields stay `None` until their
/// producing stage succeeds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Artifacts {
    pub raw_path: Option<PathBuf>,
    pub raw_uri: Option<String>,
    pub processed_path: Option<PathBuf>,
    pub processed_uri: Option<String>,
    pub load_job: Option<String>,
}

/// One execution of the pipeline.
#[derive(Debug, Clone)]
pub struct Run {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub source_url: String,
    pub working_dir: PathBuf,
    pub artifacts: Artifacts,
    pub rows: u64,
    state: RunState,
    transitions: Vec<Transition>,
}

impl Run {
    pub fn new(source_url: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            started_at: Utc::now(),
            source_url: source_url.into(),
            working_dir: working_dir.into(),
            artifacts: Artifacts::default(),
            rows: 0,
            state: RunState::Pending,
            transitions: Vec::new(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Move to the next state on the main path and return it. A terminal run
    /// stays where it is.
    pub fn advance(&mut self) -> RunState {
        if let Some(next) = self.state.next() {
            self.move_to(next);
        }
        self.state
    }

    /// Move to `Failed` and return the state the run failed in.
    pub fn fail(&mut self) -> RunState {
        let failed_in = self.state;
        if !self.state.is_terminal() {
            self.move_to(RunState::Failed);
        }
        failed_in
    }

    pub(crate) fn into_parts(self) -> (Vec<Transition>, Artifacts) {
        (self.transitions, self.artifacts)
    }

    fn move_to(&mut self, to: RunState) {
        let from = self.state;
        info!(run_id = %self.run_id, from = %from, to = %to, "Run state changed");
        self.transitions.push(Transition {
            from,
            to,
            at: Utc::now(),
        });
        self.state = to;
    }
}
