//! Batch lifecycle controller.
//!
//! Drives a validated parameter set through resolution, worklist construction and per-image
//! integration, emitting events for presentation layers and keeping the run record current.

use crate::driver::IntegrationDriver;
use crate::engine::IntegrationEngine;
use crate::error::{BatchError, DriverError, FatalError};
use crate::model::{
    BatchControl, BatchEvent, BatchState, BatchSummary, ItemOutcome, RunStatus, WorkItem,
};
use crate::params::ParameterSet;
use crate::record::{self, RunRecordWriter, RECORD_EXTENSION};
use crate::resolver::{build_worklist, DirectoryResolver};
use std::path::PathBuf;
use std::time::Instant;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

/// Inputs of a batch besides the parameter set.
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    pub roots: Vec<PathBuf>,
    /// Defaults to a timestamped `.rec` file in the output root.
    pub record_path: Option<PathBuf>,
    /// Subdirectory name filter; `ALL` or `None` keeps every directory.
    pub keyword: Option<String>,
}

/// Tracks the batch state and reports every transition.
struct StateMachine<'a> {
    state: BatchState,
    event_tx: &'a UnboundedSender<BatchEvent>,
}

impl<'a> StateMachine<'a> {
    fn new(event_tx: &'a UnboundedSender<BatchEvent>) -> Self {
        Self {
            state: BatchState::Idle,
            event_tx,
        }
    }

    fn advance(&mut self, to: BatchState) {
        debug_assert!(
            self.state.can_transition_to(to),
            "illegal transition {} -> {}",
            self.state,
            to
        );
        debug!(from = %self.state, to = %to, "batch state changed");
        let _ = self.event_tx.send(BatchEvent::StateChanged {
            from: self.state,
            to,
        });
        self.state = to;
    }

    fn emit(&self, event: BatchEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Runs one batch to completion. Integration is sequential; cancellation is checked between
/// items.
pub struct BatchOrchestrator<E: IntegrationEngine> {
    engine: E,
}

impl<E: IntegrationEngine> BatchOrchestrator<E> {
    pub fn new(engine: E) -> Self {
        Self { engine }
    }

    pub fn run(
        self,
        params: &ParameterSet,
        options: BatchOptions,
        event_tx: UnboundedSender<BatchEvent>,
        mut control_rx: UnboundedReceiver<BatchControl>,
    ) -> Result<BatchSummary, BatchError> {
        let started = Instant::now();
        let mut machine = StateMachine::new(&event_tx);

        machine.advance(BatchState::ParamsReady);
        if let Err(e) = params.validate() {
            machine.advance(BatchState::Aborted);
            return Err(e.into());
        }

        machine.advance(BatchState::Resolving);
        let mut resolver = DirectoryResolver::new(params.facility);
        if let Some(keyword) = options.keyword.as_deref() {
            resolver = resolver.with_keyword(keyword);
        }
        let prepared = resolver
            .resolve(&options.roots)
            .and_then(|res| build_worklist(&res, &params.output_root).map(|w| (res, w)));
        let (resolution, worklist) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                machine.advance(BatchState::Aborted);
                return Err(e.into());
            }
        };

        for skipped in &resolution.skipped {
            machine.emit(BatchEvent::DirectorySkipped {
                path: skipped.clone(),
            });
        }
        machine.emit(BatchEvent::WorklistReady {
            directories: resolution.sources.len(),
            images: worklist.len(),
        });
        info!(
            facility = %params.facility,
            directories = resolution.sources.len(),
            images = worklist.len(),
            "worklist ready"
        );

        let record_path = options.record_path.unwrap_or_else(|| {
            params
                .output_root
                .join(record::default_file_name(RECORD_EXTENSION))
        });
        let mut run = Run {
            summary: BatchSummary::new(worklist.len(), record_path.clone()),
            record: None,
            started,
        };

        let mut record = match RunRecordWriter::open(&record_path, params) {
            Ok(record) => record,
            Err(cause) => return Err(run.abort(&mut machine, cause)),
        };
        for source in &resolution.sources {
            if let Err(cause) = record.record_directory(&source.source_dir) {
                run.record = Some(record);
                return Err(run.abort(&mut machine, cause));
            }
        }
        run.record = Some(record);

        let driver = match IntegrationDriver::new(self.engine, params) {
            Ok(driver) => driver,
            Err(cause) => return Err(run.abort(&mut machine, cause)),
        };

        machine.advance(BatchState::Running);
        let total = worklist.len();
        for (i, item) in worklist.iter().enumerate() {
            if cancel_requested(&mut control_rx) {
                info!(processed = i, total, "batch cancelled");
                run.summary.cancelled = true;
                break;
            }
            if let Err(cause) = run.step(&driver, &machine, item, i + 1, total) {
                return Err(run.abort(&mut machine, cause));
            }
        }

        let status = if run.summary.cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };
        if let Some(record) = run.record.take() {
            if let Err(cause) = record.close(status) {
                return Err(run.abort(&mut machine, cause));
            }
        }
        run.summary.status = status;
        run.summary.elapsed = run.started.elapsed();
        machine.advance(BatchState::Finalized);
        info!(
            succeeded = run.summary.succeeded,
            skipped = run.summary.skipped,
            failed = run.summary.failed,
            "batch finished"
        );
        Ok(run.summary)
    }
}

/// Mutable bookkeeping of a batch once it has a worklist.
struct Run {
    summary: BatchSummary,
    record: Option<RunRecordWriter>,
    started: Instant,
}

impl Run {
    /// Integrate one item and account for it. Only fatal conditions are returned.
    fn step<E: IntegrationEngine>(
        &mut self,
        driver: &IntegrationDriver<E>,
        machine: &StateMachine<'_>,
        item: &WorkItem,
        index: usize,
        total: usize,
    ) -> Result<(), FatalError> {
        let outcome = match driver.process(item) {
            Ok(outcome) => outcome,
            Err(DriverError::Item(e)) => {
                warn!(image = %e.image.display(), reason = %e.reason, "integration failed");
                ItemOutcome::Failed { reason: e.reason }
            }
            Err(DriverError::Fatal(cause)) => return Err(cause),
        };

        if matches!(outcome, ItemOutcome::Integrated { .. }) {
            if let Some(record) = self.record.as_mut() {
                record.record_image(&item.source_image)?;
            }
        }

        self.summary.tally(&item.source_image, &outcome);
        machine.emit(BatchEvent::ItemCompleted {
            index,
            total,
            image: item.source_image.clone(),
            outcome,
        });
        Ok(())
    }

    /// Finalize the record as aborted and build the error carrying the partial summary.
    fn abort(&mut self, machine: &mut StateMachine<'_>, cause: FatalError) -> BatchError {
        error!(%cause, "batch aborted");
        if let Some(record) = self.record.take() {
            if let Err(e) = record.close(RunStatus::Aborted) {
                error!(error = %e, "could not finalize run record");
            }
        }
        self.summary.status = RunStatus::Aborted;
        self.summary.elapsed = self.started.elapsed();
        machine.advance(BatchState::Aborted);
        BatchError::Aborted {
            cause,
            summary: Box::new(self.summary.clone()),
        }
    }
}

/// Drain pending control messages. A closed channel means nobody can cancel any more.
fn cancel_requested(control_rx: &mut UnboundedReceiver<BatchControl>) -> bool {
    let mut cancel = false;
    loop {
        match control_rx.try_recv() {
            Ok(BatchControl::Cancel) => cancel = true,
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        }
    }
    cancel
}
