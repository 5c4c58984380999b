//! Guided batch integration of 2D detector images into 1D patterns.
//!
//! A validated [`params::ParameterSet`] and a list of root directories go in; the
//! [`orchestrator::BatchOrchestrator`] resolves the facility layout into a worklist, drives an
//! [`engine::IntegrationEngine`] over it one image at a time, and keeps a
//! [`record::RunRecordWriter`] current as it goes.

pub mod driver;
pub mod engine;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod params;
pub mod record;
pub mod resolver;
