//! Integrates one work item into one pattern file.

use crate::engine::{IntegrationEngine, IntegrationRequest};
use crate::error::{DriverError, EngineError, FatalError, ItemError};
use crate::model::{ItemOutcome, WorkItem};
use crate::params::{ErrorModel, ParameterSet, XUnit};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Holds the engine with the calibration and mask loaded once for the whole batch.
pub struct IntegrationDriver<E: IntegrationEngine> {
    engine: E,
    geometry: E::Geometry,
    mask: E::Mask,
    calibration_path: PathBuf,
    mask_path: PathBuf,
    request: IntegrationRequest,
}

impl<E: IntegrationEngine> IntegrationDriver<E> {
    pub fn new(engine: E, params: &ParameterSet) -> Result<Self, FatalError> {
        let geometry = engine.load_geometry(&params.calibration).map_err(|source| {
            FatalError::ArtifactLoad {
                what: "calibration",
                path: params.calibration.clone(),
                source,
            }
        })?;
        let mask = engine
            .load_mask(&params.mask)
            .map_err(|source| FatalError::ArtifactLoad {
                what: "mask",
                path: params.mask.clone(),
                source,
            })?;
        debug!(
            calibration = %params.calibration.display(),
            mask = %params.mask.display(),
            "loaded calibration and mask"
        );
        Ok(Self {
            engine,
            geometry,
            mask,
            calibration_path: params.calibration.clone(),
            mask_path: params.mask.clone(),
            request: IntegrationRequest::from(params),
        })
    }

    fn x_unit(&self) -> XUnit {
        self.request.x_unit
    }

    fn error_model(&self) -> ErrorModel {
        self.request.error_model
    }

    /// The calibration and mask must stay on disk for the whole batch.
    pub fn check_artifacts(&self) -> Result<(), FatalError> {
        if !self.calibration_path.is_file() {
            return Err(FatalError::CalibrationLost {
                path: self.calibration_path.clone(),
            });
        }
        if !self.mask_path.is_file() {
            return Err(FatalError::MaskLost {
                path: self.mask_path.clone(),
            });
        }
        Ok(())
    }

    /// Integrate `item`. An existing output file is never replaced.
    pub fn process(&self, item: &WorkItem) -> Result<ItemOutcome, DriverError> {
        self.check_artifacts()?;

        let output = item.output_path(self.error_model().pattern_extension());
        if output.exists() {
            warn!(output = %output.display(), "output exists, skipping");
            return Ok(ItemOutcome::Skipped { output });
        }

        let item_error = |reason: String| ItemError {
            image: item.source_image.clone(),
            reason,
        };

        let pattern = match self.engine.integrate(
            &item.source_image,
            &self.geometry,
            &self.mask,
            &self.request,
        ) {
            Ok(pattern) => pattern,
            Err(e @ EngineError::Unavailable { .. }) => {
                return Err(FatalError::EngineUnavailable(e).into())
            }
            Err(e) => return Err(item_error(e.to_string()).into()),
        };

        let mut tmp = NamedTempFile::new_in(&item.output_dir)
            .map_err(|source| unwritable(&item.output_dir, source))?;
        {
            let mut out = BufWriter::new(tmp.as_file_mut());
            let written = pattern
                .write_columns(&mut out, self.x_unit(), self.error_model())
                .and_then(|()| out.flush());
            match written {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    return Err(item_error(e.to_string()).into());
                }
                Err(e) => return Err(unwritable(&item.output_dir, e).into()),
            }
        }

        match tmp.persist_noclobber(&output) {
            Ok(_) => {
                debug!(output = %output.display(), points = pattern.len(), "pattern written");
                Ok(ItemOutcome::Integrated { output })
            }
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                warn!(output = %output.display(), "output appeared during integration, skipping");
                Ok(ItemOutcome::Skipped { output })
            }
            Err(e) => Err(unwritable(&item.output_dir, e.error).into()),
        }
    }
}

fn unwritable(dir: &Path, source: io::Error) -> FatalError {
    FatalError::OutputUnwritable {
        path: dir.to_path_buf(),
        source,
    }
}
