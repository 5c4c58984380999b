use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One image to integrate. Built by the worklist builder and consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub source_image: PathBuf,
    pub output_dir: PathBuf,
    pub output_stem: String,
}

impl WorkItem {
    /// `<output_dir>/<output_stem>.<extension>`
    pub fn output_path(&self, extension: &str) -> PathBuf {
        self.output_dir
            .join(format!("{}.{}", self.output_stem, extension))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchState {
    Idle,
    ParamsReady,
    Resolving,
    Running,
    Finalized,
    Aborted,
}

impl BatchState {
    /// Whether the orchestrator may move from `self` to `next`.
    pub fn can_transition_to(self, next: BatchState) -> bool {
        use BatchState::*;
        matches!(
            (self, next),
            (Idle, ParamsReady)
                | (ParamsReady, Resolving)
                | (Resolving, Running)
                | (Running, Finalized)
                | (ParamsReady | Resolving | Running, Aborted)
        )
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchState::Idle => "idle",
            BatchState::ParamsReady => "params-ready",
            BatchState::Resolving => "resolving",
            BatchState::Running => "running",
            BatchState::Finalized => "finalized",
            BatchState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// How a single work item ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemOutcome {
    Integrated { output: PathBuf },
    /// Output already existed and was left untouched.
    Skipped { output: PathBuf },
    Failed { reason: String },
}

/// Events emitted by the orchestrator and consumed by presentation layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BatchEvent {
    StateChanged {
        from: BatchState,
        to: BatchState,
    },
    WorklistReady {
        directories: usize,
        images: usize,
    },
    DirectorySkipped {
        path: PathBuf,
    },
    /// Exactly one per processed work item. `index` is 1-based.
    ItemCompleted {
        index: usize,
        total: usize,
        image: PathBuf,
        outcome: ItemOutcome,
    },
}

impl BatchEvent {
    /// Render a human-readable progress line, or `None` for events that have no text form.
    pub fn to_message(&self) -> Option<String> {
        match self {
            BatchEvent::StateChanged { .. } => None,
            BatchEvent::WorklistReady {
                directories,
                images,
            } => Some(format!(
                "Found {images} image(s) in {directories} director{}",
                if *directories == 1 { "y" } else { "ies" }
            )),
            BatchEvent::DirectorySkipped { path } => {
                Some(format!("Skipped directory {}", path.display()))
            }
            BatchEvent::ItemCompleted {
                index,
                total,
                image,
                outcome,
            } => {
                let name = display_name(image);
                Some(match outcome {
                    ItemOutcome::Integrated { .. } => format!("[{index}/{total}] {name}"),
                    ItemOutcome::Skipped { output } => format!(
                        "[{index}/{total}] {name}: skipped, {} already exists",
                        output.display()
                    ),
                    ItemOutcome::Failed { reason } => {
                        format!("[{index}/{total}] {name}: FAILED ({reason})")
                    }
                })
            }
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Commands sent to a running batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchControl {
    Cancel,
}

/// Status written to the run record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    InProgress,
    Completed,
    Cancelled,
    Aborted,
}

impl RunStatus {
    pub fn token(self) -> &'static str {
        match self {
            RunStatus::InProgress => "in-progress",
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Aborted => "aborted",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim() {
            "in-progress" => Some(RunStatus::InProgress),
            "completed" => Some(RunStatus::Completed),
            "cancelled" => Some(RunStatus::Cancelled),
            "aborted" => Some(RunStatus::Aborted),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub image: PathBuf,
    pub reason: String,
}

/// Final accounting of a batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub status: RunStatus,
    pub total: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: bool,
    #[serde(default)]
    pub failures: Vec<ItemFailure>,
    pub record_path: PathBuf,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

impl BatchSummary {
    pub fn new(total: usize, record_path: PathBuf) -> Self {
        Self {
            status: RunStatus::InProgress,
            total,
            succeeded: 0,
            skipped: 0,
            failed: 0,
            cancelled: false,
            failures: Vec::new(),
            record_path,
            elapsed: Duration::ZERO,
        }
    }

    /// Items that reached an outcome, whatever it was.
    pub fn processed(&self) -> usize {
        self.succeeded + self.skipped + self.failed
    }

    pub fn tally(&mut self, image: &Path, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Integrated { .. } => self.succeeded += 1,
            ItemOutcome::Skipped { .. } => self.skipped += 1,
            ItemOutcome::Failed { reason } => {
                self.failed += 1;
                self.failures.push(ItemFailure {
                    image: image.to_path_buf(),
                    reason: reason.clone(),
                });
            }
        }
    }
}
