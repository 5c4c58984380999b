//! Integration parameters.
//!
//! A [`ParameterSet`] is built once (from CLI flags or a `.int` file), validated, and then
//! passed by reference to every component of a batch. Nothing downstream mutates it.

mod codec;

pub use codec::{load, parse, render, save, NOTES_MARKER};
pub(crate) use codec::write_atomic;

use crate::error::ValidationError;
use std::fmt;
use std::path::{Path, PathBuf};

/// Accepted calibration extension.
pub const CALIBRATION_EXTENSION: &str = "poni";
/// Accepted mask extensions.
pub const MASK_EXTENSIONS: &[&str] = &["tif", "edf", "npy", "msk"];

pub const DEFAULT_RADIAL_POINTS: usize = 6000;
pub const DEFAULT_AUTOMASK_THRESHOLD: f64 = -1e-10;

/// Closed set of token-backed choices used by the parameter file.
pub trait Choice: Sized + Copy + 'static {
    /// Human-readable list of accepted tokens, used in error messages.
    const EXPECTED: &'static str;

    /// Canonical token written to parameter files.
    fn token(self) -> &'static str;

    /// Parse a token, accepting case variations and the historical aliases.
    fn from_token(token: &str) -> Option<Self>;
}

/// Beamline data layout. Selects the directory convention and image extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Facility {
    /// `root/<sample>/dark_sub/*.tiff`
    Nsls2,
    /// `root/*.tif`
    ApsSingle,
    /// `root/<sample>/*.tif`
    ApsMulti,
    /// Same layout as [`Facility::ApsMulti`].
    Ssrl,
}

impl Facility {
    /// Image extension (without dot) searched for by the resolver.
    pub fn image_extension(self) -> &'static str {
        match self {
            Facility::Nsls2 => "tiff",
            Facility::ApsSingle | Facility::ApsMulti | Facility::Ssrl => "tif",
        }
    }
}

impl Choice for Facility {
    const EXPECTED: &'static str = "NSLS2, APS_single, APS_multi, SSRL";

    fn token(self) -> &'static str {
        match self {
            Facility::Nsls2 => "NSLS2",
            Facility::ApsSingle => "APS_single",
            Facility::ApsMulti => "APS_multi",
            Facility::Ssrl => "SSRL",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "nsls2" | "nsls-ii" | "nsls_ii" | "nsls-2" => Some(Facility::Nsls2),
            "aps_single" | "aps-single" => Some(Facility::ApsSingle),
            // Older parameter files only distinguished "APS", which used the per-sample layout.
            "aps_multi" | "aps-multi" | "aps" => Some(Facility::ApsMulti),
            "ssrl" => Some(Facility::Ssrl),
            _ => None,
        }
    }
}

/// Pixel splitting policy handed to the integration engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SplitMethod {
    NoSplit,
    Full,
    Bbox,
    Pseudo,
}

impl Choice for SplitMethod {
    const EXPECTED: &'static str = "none, full, bbox, pseudo";

    fn token(self) -> &'static str {
        match self {
            SplitMethod::NoSplit => "none",
            SplitMethod::Full => "full",
            SplitMethod::Bbox => "bbox",
            SplitMethod::Pseudo => "pseudo",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "none" | "no" => Some(SplitMethod::NoSplit),
            "full" => Some(SplitMethod::Full),
            "bbox" => Some(SplitMethod::Bbox),
            "pseudo" => Some(SplitMethod::Pseudo),
            _ => None,
        }
    }
}

/// Radial axis unit of the integrated pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XUnit {
    TwoThetaDeg,
    TwoThetaRad,
    QInvNm,
    QInvAngstrom,
    DStarSquared,
    RadiusMm,
}

impl Choice for XUnit {
    const EXPECTED: &'static str = "2th_deg, 2th_rad, q_nm^-1, q_A^-1, d*2_A^-2, r_mm";

    fn token(self) -> &'static str {
        match self {
            XUnit::TwoThetaDeg => "2th_deg",
            XUnit::TwoThetaRad => "2th_rad",
            XUnit::QInvNm => "q_nm^-1",
            XUnit::QInvAngstrom => "q_A^-1",
            XUnit::DStarSquared => "d*2_A^-2",
            XUnit::RadiusMm => "r_mm",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "2th_deg" | "tth" => Some(XUnit::TwoThetaDeg),
            "2th_rad" => Some(XUnit::TwoThetaRad),
            "q_nm^-1" => Some(XUnit::QInvNm),
            "q_a^-1" | "q" => Some(XUnit::QInvAngstrom),
            "d*2_a^-2" => Some(XUnit::DStarSquared),
            "r_mm" => Some(XUnit::RadiusMm),
            _ => None,
        }
    }
}

/// Intensity error propagation model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorModel {
    NoErrors,
    Poisson,
}

impl ErrorModel {
    /// Extension of the pattern files written under this model.
    pub fn pattern_extension(self) -> &'static str {
        match self {
            ErrorModel::NoErrors => "xy",
            ErrorModel::Poisson => "xye",
        }
    }
}

impl Choice for ErrorModel {
    const EXPECTED: &'static str = "none, poisson";

    fn token(self) -> &'static str {
        match self {
            ErrorModel::NoErrors => "none",
            ErrorModel::Poisson => "poisson",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "none" => Some(ErrorModel::NoErrors),
            "poisson" => Some(ErrorModel::Poisson),
            _ => None,
        }
    }
}

macro_rules! display_as_token {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.token())
            }
        })*
    };
}

display_as_token!(Facility, SplitMethod, XUnit, ErrorModel);

/// Closed interval `[lower, upper]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Range {
    pub lower: f64,
    pub upper: f64,
}

impl Range {
    pub fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }
}

impl std::str::FromStr for Range {
    type Err = &'static str;

    /// Accepts `lo, hi`, optionally wrapped in `()` or `[]`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        let inner = value
            .strip_prefix('(')
            .and_then(|v| v.strip_suffix(')'))
            .or_else(|| value.strip_prefix('[').and_then(|v| v.strip_suffix(']')))
            .unwrap_or(value);

        let bounds: Vec<&str> = inner.split(',').map(str::trim).collect();
        let [lower, upper] = bounds.as_slice() else {
            return Err("expected two comma-separated numbers");
        };
        let lower: f64 = lower.parse().map_err(|_| "bounds must be numbers")?;
        let upper: f64 = upper.parse().map_err(|_| "bounds must be numbers")?;
        if lower > upper {
            return Err("lower bound exceeds upper bound");
        }
        Ok(Range { lower, upper })
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.lower, self.upper)
    }
}

/// Names of the recognized parameter-file keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamField {
    Facility,
    OutputRoot,
    Calibration,
    Mask,
    SplitMethod,
    XUnit,
    RadialPoints,
    RadialRange,
    AzimuthalRange,
    AutomaskThreshold,
    ErrorModel,
}

impl ParamField {
    pub const ALL: [ParamField; 11] = [
        ParamField::Facility,
        ParamField::OutputRoot,
        ParamField::Calibration,
        ParamField::Mask,
        ParamField::SplitMethod,
        ParamField::XUnit,
        ParamField::RadialPoints,
        ParamField::RadialRange,
        ParamField::AzimuthalRange,
        ParamField::AutomaskThreshold,
        ParamField::ErrorModel,
    ];

    /// Key as written in `.int` files.
    pub fn key(self) -> &'static str {
        match self {
            ParamField::Facility => "Data from NSLS-II, APS, or SSRL",
            ParamField::OutputRoot => "Main integrated pattern directory",
            ParamField::Calibration => "Poni file",
            ParamField::Mask => "Mask file",
            ParamField::SplitMethod => "Pixel splitting method",
            ParamField::XUnit => "X unit",
            ParamField::RadialPoints => "Radial (x-unit) points",
            ParamField::RadialRange => "Radial (x-unit) range",
            ParamField::AzimuthalRange => "Azimuthal (deg.) range",
            ParamField::AutomaskThreshold => "Automask pixel value",
            ParamField::ErrorModel => "Intensity error model",
        }
    }

    /// One-line description written into the header of rendered parameter files.
    pub fn description(self) -> String {
        match self {
            ParamField::Facility => format!(
                "where the data was collected ({}). NSLS2 images are .tiff files in a \
                 'dark_sub' subdirectory, the others are .tif",
                Facility::EXPECTED
            ),
            ParamField::OutputRoot => {
                "directory under which one subdirectory of patterns is created per source \
                 directory"
                    .into()
            }
            ParamField::Calibration => {
                "instrument geometry (sample-to-detector distance, detector tilts), must be a \
                 .poni file"
                    .into()
            }
            ParamField::Mask => {
                "static mask (beamstop, detector edges), one of .tif, .edf, .npy or .msk".into()
            }
            ParamField::SplitMethod => format!(
                "one of {} (no splitting, full splitting, bounding box, scaled down bounding box)",
                SplitMethod::EXPECTED
            ),
            ParamField::XUnit => format!("one of {}", XUnit::EXPECTED),
            ParamField::RadialPoints => "number of bins along the x axis, a whole number".into(),
            ParamField::RadialRange => {
                "x-unit range to integrate over as 'lo, hi', or None for the full range".into()
            }
            ParamField::AzimuthalRange => {
                "azimuthal range in degrees as 'lo, hi', or None for the full azimuth".into()
            }
            ParamField::AutomaskThreshold => {
                "pixels with intensity below this value are masked, a number or None".into()
            }
            ParamField::ErrorModel => format!(
                "one of {} (poisson takes the variance as I and writes .xye files)",
                ErrorModel::EXPECTED
            ),
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        let key = key.trim();
        Self::ALL
            .into_iter()
            .find(|field| field.key().eq_ignore_ascii_case(key))
    }
}

impl fmt::Display for ParamField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Everything needed to integrate one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSet {
    pub facility: Facility,
    /// Parent of the per-source output directories.
    pub output_root: PathBuf,
    pub calibration: PathBuf,
    pub mask: PathBuf,
    pub split_method: SplitMethod,
    pub x_unit: XUnit,
    pub radial_points: usize,
    /// `None` integrates the full radial range.
    pub radial_range: Option<Range>,
    /// `None` integrates the full azimuth.
    pub azimuthal_range: Option<Range>,
    /// Pixels below this value are masked; `None` disables automasking.
    pub automask_threshold: Option<f64>,
    pub error_model: ErrorModel,
    /// Free text kept after the notes marker of a parameter file.
    pub notes: String,
}

impl ParameterSet {
    /// A parameter set with the historical defaults for every numeric knob.
    /// Call [`ParameterSet::validate`] before using it for a run.
    pub fn with_defaults(
        facility: Facility,
        output_root: impl Into<PathBuf>,
        calibration: impl Into<PathBuf>,
        mask: impl Into<PathBuf>,
    ) -> Self {
        Self {
            facility,
            output_root: output_root.into(),
            calibration: calibration.into(),
            mask: mask.into(),
            split_method: SplitMethod::Full,
            x_unit: XUnit::TwoThetaDeg,
            radial_points: DEFAULT_RADIAL_POINTS,
            radial_range: None,
            azimuthal_range: None,
            automask_threshold: Some(DEFAULT_AUTOMASK_THRESHOLD),
            error_model: ErrorModel::NoErrors,
            notes: String::new(),
        }
    }

    /// Check artifact paths against the filesystem and numeric fields against their domains.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, path) in [
            (ParamField::OutputRoot, &self.output_root),
            (ParamField::Calibration, &self.calibration),
            (ParamField::Mask, &self.mask),
        ] {
            validate_path_text(field, path)?;
        }
        validate_output_root(&self.output_root)?;
        validate_artifact(
            ParamField::Calibration,
            &self.calibration,
            &[CALIBRATION_EXTENSION],
            ".poni",
        )?;
        validate_artifact(
            ParamField::Mask,
            &self.mask,
            MASK_EXTENSIONS,
            ".tif, .edf, .npy, .msk",
        )?;
        if self.radial_points == 0 {
            return Err(ValidationError::NotPositive {
                field: ParamField::RadialPoints,
            });
        }
        validate_range(ParamField::RadialRange, self.radial_range)?;
        validate_range(ParamField::AzimuthalRange, self.azimuthal_range)?;
        if let Some(threshold) = self.automask_threshold {
            if !threshold.is_finite() {
                return Err(ValidationError::NotANumber {
                    field: ParamField::AutomaskThreshold,
                    value: threshold.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Consume the set, returning it only if it validates.
    pub fn finalize(self) -> Result<Self, ValidationError> {
        self.validate()?;
        Ok(self)
    }
}

/// Parameter files trim values, so a path with edge whitespace cannot be written back.
fn validate_path_text(field: ParamField, path: &Path) -> Result<(), ValidationError> {
    let text = path.to_string_lossy();
    if text.trim() != text {
        return Err(ValidationError::PathWhitespace {
            field,
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

fn validate_output_root(path: &Path) -> Result<(), ValidationError> {
    if path.as_os_str().is_empty() {
        return Err(ValidationError::EmptyPath {
            field: ParamField::OutputRoot,
        });
    }
    if path.exists() && !path.is_dir() {
        return Err(ValidationError::NotADirectory {
            field: ParamField::OutputRoot,
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

fn validate_artifact(
    field: ParamField,
    path: &Path,
    extensions: &[&str],
    allowed: &'static str,
) -> Result<(), ValidationError> {
    if path.as_os_str().is_empty() {
        return Err(ValidationError::EmptyPath { field });
    }
    let ext_ok = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.iter().any(|a| a.eq_ignore_ascii_case(e)))
        .unwrap_or(false);
    if !ext_ok {
        return Err(ValidationError::BadExtension {
            field,
            path: path.to_path_buf(),
            allowed,
        });
    }
    if !path.is_file() {
        return Err(ValidationError::FileNotFound {
            field,
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

fn validate_range(field: ParamField, range: Option<Range>) -> Result<(), ValidationError> {
    let Some(range) = range else {
        return Ok(());
    };
    if !range.lower.is_finite() || !range.upper.is_finite() {
        return Err(ValidationError::MalformedRange {
            field,
            value: range.to_string(),
            reason: "bounds must be finite numbers",
        });
    }
    if range.lower > range.upper {
        return Err(ValidationError::MalformedRange {
            field,
            value: range.to_string(),
            reason: "lower bound exceeds upper bound",
        });
    }
    Ok(())
}
