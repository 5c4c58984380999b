//! Integration engine seam.
//!
//! The numeric azimuthal integration is delegated to an [`IntegrationEngine`]. The batch code
//! only depends on this trait; [`ExternalEngine`] is the shipped implementation.

mod external;

pub use external::{ExternalEngine, ENGINE_ENV};

use crate::error::EngineError;
use crate::params::{ErrorModel, ParameterSet, Range, SplitMethod, XUnit};
use std::io::{self, Write};
use std::path::Path;

/// Scalar integration settings passed with every image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntegrationRequest {
    pub radial_points: usize,
    pub x_unit: XUnit,
    pub split_method: SplitMethod,
    pub radial_range: Option<Range>,
    pub azimuthal_range: Option<Range>,
    pub automask_threshold: Option<f64>,
    pub error_model: ErrorModel,
}

impl From<&ParameterSet> for IntegrationRequest {
    fn from(p: &ParameterSet) -> Self {
        Self {
            radial_points: p.radial_points,
            x_unit: p.x_unit,
            split_method: p.split_method,
            radial_range: p.radial_range,
            azimuthal_range: p.azimuthal_range,
            automask_threshold: p.automask_threshold,
            error_model: p.error_model,
        }
    }
}

/// A 1D integrated pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    pub radial: Vec<f64>,
    pub intensity: Vec<f64>,
    /// Per-point intensity uncertainty, present when an error model is in use.
    pub sigma: Option<Vec<f64>>,
}

impl Pattern {
    /// Build a pattern, rejecting empty or ragged columns.
    pub fn new(
        radial: Vec<f64>,
        intensity: Vec<f64>,
        sigma: Option<Vec<f64>>,
    ) -> Result<Self, EngineError> {
        if radial.is_empty() {
            return Err(EngineError::Failed("engine returned an empty pattern".into()));
        }
        let ragged = intensity.len() != radial.len()
            || sigma.as_ref().is_some_and(|s| s.len() != radial.len());
        if ragged {
            return Err(EngineError::Failed(format!(
                "engine returned columns of unequal length ({} radial, {} intensity)",
                radial.len(),
                intensity.len()
            )));
        }
        Ok(Self {
            radial,
            intensity,
            sigma,
        })
    }

    pub fn len(&self) -> usize {
        self.radial.len()
    }

    pub fn is_empty(&self) -> bool {
        self.radial.is_empty()
    }

    /// Write as tab-separated columns under a `#<unit>\tI[\tI_err]` header. The error column is
    /// written only when `error_model` asks for it.
    pub fn write_columns<W: Write>(
        &self,
        out: &mut W,
        x_unit: XUnit,
        error_model: ErrorModel,
    ) -> io::Result<()> {
        let sigma = match error_model {
            ErrorModel::NoErrors => None,
            ErrorModel::Poisson => Some(self.sigma.as_deref().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    "error model requires an uncertainty column",
                )
            })?),
        };

        match sigma {
            Some(_) => writeln!(out, "#{x_unit}\tI\tI_err")?,
            None => writeln!(out, "#{x_unit}\tI")?,
        }
        for i in 0..self.radial.len() {
            write!(out, "{:.8}\t{:.8}", self.radial[i], self.intensity[i])?;
            if let Some(sigma) = sigma {
                write!(out, "\t{:.8}", sigma[i])?;
            }
            writeln!(out)?;
        }
        Ok(())
    }
}

/// Integrates one image with a geometry and mask that are loaded once per batch.
pub trait IntegrationEngine {
    type Geometry;
    type Mask;

    fn load_geometry(&self, calibration: &Path) -> Result<Self::Geometry, EngineError>;

    fn load_mask(&self, mask: &Path) -> Result<Self::Mask, EngineError>;

    fn integrate(
        &self,
        image: &Path,
        geometry: &Self::Geometry,
        mask: &Self::Mask,
        request: &IntegrationRequest,
    ) -> Result<Pattern, EngineError>;
}
