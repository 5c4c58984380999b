//! Application-level orchestration.
//!
//! This module owns the batch lifecycle (validate, resolve, integrate, finalize) and post-run
//! processing such as summary exports. CLI layers call into this module to keep
//! responsibilities separated.

mod controller;
mod post_process;

pub use controller::{BatchOptions, BatchOrchestrator};
pub use post_process::{export_json, process_batch_completion};
