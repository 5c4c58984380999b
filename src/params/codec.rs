//! `.int` parameter file reading and writing.
//!
//! The file is a sequence of `Key: value` lines framed by `#` comment lines. Everything after
//! [`NOTES_MARKER`] (and the rule line that follows it) is free text carried in
//! [`ParameterSet::notes`].

use super::{Choice, ErrorModel, Facility, ParamField, ParameterSet, Range, SplitMethod, XUnit};
use crate::error::ValidationError;
use std::borrow::Cow;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

pub const NOTES_MARKER: &str = "User notes / metadata allowed below here:";
const SETUP_MARKER: &str = "Integration parameters and setup.";
const RULE_WIDTH: usize = 100;

/// One classified line of a parameter file.
#[derive(Debug, Clone, PartialEq)]
enum Token<'a> {
    Blank,
    Comment,
    /// Prose without a key separator.
    Text,
    Field {
        line: usize,
        key: &'a str,
        value: Cow<'a, str>,
    },
    NotesMarker,
}

/// Streaming classifier. Stops after yielding [`Token::NotesMarker`]; the rest of the input is
/// then available verbatim from [`LineClassifier::notes`].
struct LineClassifier<'a> {
    rest: &'a str,
    line: usize,
    in_notes: bool,
}

impl<'a> LineClassifier<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            rest: text,
            line: 0,
            in_notes: false,
        }
    }

    /// Notes trailer with its leading rule line removed. Empty if no marker was seen.
    fn notes(&self) -> &'a str {
        if !self.in_notes {
            return "";
        }
        let (first, after) = match self.rest.find('\n') {
            Some(i) => (&self.rest[..i], &self.rest[i + 1..]),
            None => (self.rest, ""),
        };
        let first = first.trim();
        if !first.is_empty() && first.chars().all(|c| c == '#') {
            after
        } else {
            self.rest
        }
    }
}

impl<'a> Iterator for LineClassifier<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.in_notes || self.rest.is_empty() {
            return None;
        }
        let (raw, rest) = match self.rest.find('\n') {
            Some(i) => (&self.rest[..i], &self.rest[i + 1..]),
            None => (self.rest, ""),
        };
        self.rest = rest;
        self.line += 1;

        let trimmed = raw.trim();
        let token = if trimmed.is_empty() {
            Token::Blank
        } else if trimmed.starts_with('#') {
            Token::Comment
        } else if trimmed == NOTES_MARKER {
            self.in_notes = true;
            Token::NotesMarker
        } else {
            match trimmed.split_once(':') {
                Some((key, value)) if !key.trim().is_empty() => Token::Field {
                    line: self.line,
                    key: key.trim(),
                    value: field_value(value),
                },
                _ => Token::Text,
            }
        };
        Some(token)
    }
}

/// Cut an in-line comment at the first `#` not written as `\#`, trim, and unescape.
fn field_value(raw: &str) -> Cow<'_, str> {
    let bytes = raw.as_bytes();
    let end = (0..bytes.len())
        .find(|&i| bytes[i] == b'#' && (i == 0 || bytes[i - 1] != b'\\'))
        .unwrap_or(bytes.len());
    let value = raw[..end].trim();
    if value.contains("\\#") {
        Cow::Owned(value.replace("\\#", "#"))
    } else {
        Cow::Borrowed(value)
    }
}

/// Inverse of [`field_value`] for values that may contain `#`.
fn escape_value(value: &str) -> Cow<'_, str> {
    if value.contains('#') {
        Cow::Owned(value.replace('#', "\\#"))
    } else {
        Cow::Borrowed(value)
    }
}

/// Parse and validate the text of a `.int` file.
pub fn parse(text: &str) -> Result<ParameterSet, ValidationError> {
    let mut fields: HashMap<ParamField, Cow<'_, str>> = HashMap::new();
    let mut classifier = LineClassifier::new(text);

    for token in classifier.by_ref() {
        let Token::Field { line, key, value } = token else {
            continue;
        };
        match ParamField::from_key(key) {
            Some(field) if fields.contains_key(&field) => {
                debug!(line, key, "duplicate parameter ignored, first occurrence wins");
            }
            Some(field) => {
                fields.insert(field, value);
            }
            None => debug!(line, key, "unrecognized parameter key ignored"),
        }
    }

    let require = |field: ParamField| {
        fields
            .get(&field)
            .map(|value| &**value)
            .ok_or(ValidationError::MissingField { field })
    };

    let facility_value = require(ParamField::Facility)?;
    let facility =
        Facility::from_token(facility_value).ok_or_else(|| ValidationError::UnknownFacility {
            field: ParamField::Facility,
            value: facility_value.to_string(),
        })?;

    let params = ParameterSet {
        facility,
        output_root: parse_path(ParamField::OutputRoot, require(ParamField::OutputRoot)?)?,
        calibration: parse_path(ParamField::Calibration, require(ParamField::Calibration)?)?,
        mask: parse_path(ParamField::Mask, require(ParamField::Mask)?)?,
        split_method: parse_choice::<SplitMethod>(
            ParamField::SplitMethod,
            require(ParamField::SplitMethod)?,
        )?,
        x_unit: parse_choice::<XUnit>(ParamField::XUnit, require(ParamField::XUnit)?)?,
        radial_points: parse_points(require(ParamField::RadialPoints)?)?,
        radial_range: parse_range(ParamField::RadialRange, require(ParamField::RadialRange)?)?,
        azimuthal_range: parse_range(
            ParamField::AzimuthalRange,
            require(ParamField::AzimuthalRange)?,
        )?,
        automask_threshold: parse_threshold(require(ParamField::AutomaskThreshold)?)?,
        error_model: parse_choice::<ErrorModel>(
            ParamField::ErrorModel,
            require(ParamField::ErrorModel)?,
        )?,
        notes: classifier.notes().to_string(),
    };

    params.validate()?;
    Ok(params)
}

fn parse_path(field: ParamField, value: &str) -> Result<PathBuf, ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::EmptyPath { field });
    }
    Ok(PathBuf::from(value))
}

fn parse_choice<C: Choice>(field: ParamField, value: &str) -> Result<C, ValidationError> {
    C::from_token(value).ok_or_else(|| ValidationError::InvalidChoice {
        field,
        value: value.to_string(),
        expected: C::EXPECTED,
    })
}

fn parse_points(value: &str) -> Result<usize, ValidationError> {
    let field = ParamField::RadialPoints;
    let n: i64 = value.parse().map_err(|_| ValidationError::NotAnInteger {
        field,
        value: value.to_string(),
    })?;
    if n <= 0 {
        return Err(ValidationError::NotPositive { field });
    }
    usize::try_from(n).map_err(|_| ValidationError::NotAnInteger {
        field,
        value: value.to_string(),
    })
}

fn is_none_token(value: &str) -> bool {
    value.is_empty()
        || value.eq_ignore_ascii_case("none")
        || value.eq_ignore_ascii_case("unrestricted")
}

fn parse_range(field: ParamField, value: &str) -> Result<Option<Range>, ValidationError> {
    if is_none_token(value) {
        return Ok(None);
    }
    value
        .parse::<Range>()
        .map(Some)
        .map_err(|reason| ValidationError::MalformedRange {
            field,
            value: value.to_string(),
            reason,
        })
}

fn parse_threshold(value: &str) -> Result<Option<f64>, ValidationError> {
    if is_none_token(value) {
        return Ok(None);
    }
    value
        .parse()
        .map(Some)
        .map_err(|_| ValidationError::NotANumber {
            field: ParamField::AutomaskThreshold,
            value: value.to_string(),
        })
}

fn rule() -> String {
    "#".repeat(RULE_WIDTH)
}

fn push_field(out: &mut String, field: ParamField, value: &str) {
    out.push_str(field.key());
    out.push_str(": ");
    out.push_str(&escape_value(value));
    out.push('\n');
}

fn render_optional<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "None".to_string(), |v| v.to_string())
}

/// Render a parameter set as `.int` text. Pure: the same set always renders identically.
pub fn render(params: &ParameterSet) -> String {
    let rule = rule();
    let mut out = String::new();

    out.push_str("# Description of parameters and accepted values:\n");
    for field in ParamField::ALL {
        out.push_str(&format!("# - {}: {}\n", field.key(), field.description()));
    }
    out.push_str(&rule);
    out.push('\n');
    out.push_str(&format!("# {SETUP_MARKER}\n"));
    out.push_str(
        "# Below here user can edit parameters after the colon. In-line comments are allowed.\n",
    );
    out.push_str("# Write a literal '#' inside a value as '\\#'.\n");
    out.push_str(&rule);
    out.push('\n');

    push_field(&mut out, ParamField::Facility, params.facility.token());
    push_field(
        &mut out,
        ParamField::OutputRoot,
        &params.output_root.display().to_string(),
    );
    push_field(
        &mut out,
        ParamField::Calibration,
        &params.calibration.display().to_string(),
    );
    push_field(&mut out, ParamField::Mask, &params.mask.display().to_string());
    push_field(&mut out, ParamField::SplitMethod, params.split_method.token());
    push_field(&mut out, ParamField::XUnit, params.x_unit.token());
    push_field(
        &mut out,
        ParamField::RadialPoints,
        &params.radial_points.to_string(),
    );
    push_field(
        &mut out,
        ParamField::RadialRange,
        &render_optional(params.radial_range),
    );
    push_field(
        &mut out,
        ParamField::AzimuthalRange,
        &render_optional(params.azimuthal_range),
    );
    push_field(
        &mut out,
        ParamField::AutomaskThreshold,
        &render_optional(params.automask_threshold),
    );
    push_field(&mut out, ParamField::ErrorModel, params.error_model.token());

    out.push_str(&rule);
    out.push('\n');
    out.push_str(NOTES_MARKER);
    out.push('\n');
    out.push_str(&rule);
    out.push('\n');
    out.push_str(&params.notes);
    out
}

/// Read and parse a `.int` file.
pub fn load(path: &Path) -> anyhow::Result<ParameterSet> {
    use anyhow::Context;
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read parameter file {}", path.display()))?;
    let params =
        parse(&text).with_context(|| format!("invalid parameter file {}", path.display()))?;
    Ok(params)
}

/// Write `params` to `path`, replacing any existing file atomically.
pub fn save(path: &Path, params: &ParameterSet) -> std::io::Result<()> {
    write_atomic(path, render(params).as_bytes())
}

/// Write `contents` to a sibling temporary file and rename it over `path`.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        poni: PathBuf,
        mask: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let poni = dir.path().join("LaB6.poni");
        let mask = dir.path().join("beamstop.tif");
        fs::write(&poni, "Detector: Pilatus1M\n").unwrap();
        fs::write(&mask, b"II*\0").unwrap();
        Fixture { dir, poni, mask }
    }

    fn sample(f: &Fixture) -> ParameterSet {
        let mut p = ParameterSet::with_defaults(
            Facility::Nsls2,
            f.dir.path().join("integrated"),
            f.poni.clone(),
            f.mask.clone(),
        );
        p.x_unit = XUnit::QInvAngstrom;
        p.radial_points = 3000;
        p.radial_range = Some(Range::new(0.5, 15.25));
        p.automask_threshold = Some(-1e-10);
        p.error_model = ErrorModel::Poisson;
        p.notes = "LaB6 standard, 30 keV\nsecond line # with a hash\n".to_string();
        p
    }

    /// Replace the value of `field` in rendered text.
    fn with_value(text: &str, field: ParamField, value: &str) -> String {
        text.lines()
            .map(|l| {
                if l.starts_with(field.key()) {
                    format!("{}: {}", field.key(), value)
                } else {
                    l.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn render_then_parse_round_trips() {
        let f = fixture();
        let mut p = sample(&f);
        assert_eq!(parse(&render(&p)).unwrap(), p);

        p.radial_range = None;
        p.azimuthal_range = Some(Range::new(-180.0, 0.0));
        p.automask_threshold = None;
        p.split_method = SplitMethod::NoSplit;
        p.facility = Facility::ApsSingle;
        p.notes.clear();
        assert_eq!(parse(&render(&p)).unwrap(), p);
    }

    #[test]
    fn paths_containing_hashes_round_trip() {
        let f = fixture();
        let cal_dir = f.dir.path().join("cal#1");
        fs::create_dir(&cal_dir).unwrap();
        let poni = cal_dir.join("g.poni");
        fs::write(&poni, "").unwrap();
        let mask = f.dir.path().join("beam#stop.msk");
        fs::write(&mask, "").unwrap();

        let p = ParameterSet::with_defaults(
            Facility::ApsSingle,
            f.dir.path().join("run#3/out"),
            poni,
            mask,
        );
        let text = render(&p);
        assert!(text.contains(r"run\#3/out"));
        assert_eq!(parse(&text).unwrap(), p);

        let commented = with_value(
            &text,
            ParamField::OutputRoot,
            &format!(r"{}/run\#4  # moved", f.dir.path().display()),
        );
        assert_eq!(
            parse(&commented).unwrap().output_root,
            f.dir.path().join("run#4")
        );
    }

    #[test]
    fn escaping_is_reversible_next_to_backslashes() {
        for value in [r"C:\data\run#3", r"odd\#name", "##", r"trail\"] {
            let line = format!("Mask file: {}  # comment", escape_value(value));
            let Some(Token::Field { value: parsed, .. }) = LineClassifier::new(&line).next() else {
                panic!("not a field: {line}");
            };
            assert_eq!(parsed, value);
        }
    }

    #[test]
    fn notes_are_kept_verbatim_even_when_they_look_like_fields() {
        let f = fixture();
        let mut p = sample(&f);
        p.notes = "Poni file: /elsewhere.poni\n\n# not a comment here\nX unit: r_mm".to_string();
        let parsed = parse(&render(&p)).unwrap();
        assert_eq!(parsed.notes, p.notes);
        assert_eq!(parsed.calibration, f.poni);
        assert_eq!(parsed.x_unit, XUnit::QInvAngstrom);
    }

    #[test]
    fn hand_edited_file_is_tolerated() {
        let f = fixture();
        let text = format!(
            "# header\n\
             Some prose without a separator\n\
             Data from NSLS-II, APS, or SSRL: nsls-ii\n\
             Main integrated pattern directory: {out}   # where patterns go\n\
             Poni file: {poni}\n\
             Mask file: {mask}\n\
             Pixel splitting method: no\n\
             X unit: tth\n\
             Radial (x-unit) points: 2000\n\
             Radial (x-unit) range: [1, 20]\n\
             Azimuthal (deg.) range: none\n\
             Automask pixel value: None\n\
             Intensity error model: POISSON\n\
             Beam energy: 30 keV\n\
             Radial (x-unit) points: 9\n",
            out = f.dir.path().join("out").display(),
            poni = f.poni.display(),
            mask = f.mask.display(),
        );
        let p = parse(&text).unwrap();
        assert_eq!(p.facility, Facility::Nsls2);
        assert_eq!(p.output_root, f.dir.path().join("out"));
        assert_eq!(p.split_method, SplitMethod::NoSplit);
        assert_eq!(p.x_unit, XUnit::TwoThetaDeg);
        assert_eq!(p.radial_points, 2000);
        assert_eq!(p.radial_range, Some(Range::new(1.0, 20.0)));
        assert_eq!(p.azimuthal_range, None);
        assert_eq!(p.automask_threshold, None);
        assert_eq!(p.error_model, ErrorModel::Poisson);
        assert!(p.notes.is_empty());
    }

    #[test]
    fn rejections_name_the_field() {
        let f = fixture();
        let text = render(&sample(&f));

        let cases: Vec<(ParamField, &str)> = vec![
            (ParamField::Facility, "ESRF"),
            (ParamField::RadialPoints, "many"),
            (ParamField::RadialPoints, "0"),
            (ParamField::RadialPoints, "-5"),
            (ParamField::RadialRange, "5"),
            (ParamField::RadialRange, "1, 2, 3"),
            (ParamField::RadialRange, "low, high"),
            (ParamField::RadialRange, "20, 1"),
            (ParamField::AzimuthalRange, "(0, 90"),
            (ParamField::XUnit, "furlongs"),
            (ParamField::SplitMethod, "partial"),
            (ParamField::ErrorModel, "gaussian"),
            (ParamField::AutomaskThreshold, "low"),
            (ParamField::Calibration, "/definitely/not/here.poni"),
            (ParamField::Mask, ""),
        ];

        for (field, value) in cases {
            let err = parse(&with_value(&text, field, value))
                .expect_err(&format!("{field} = {value:?} should be rejected"));
            assert!(
                err.to_string().starts_with(field.key()),
                "error for {field} does not name it: {err}"
            );
        }
    }

    #[test]
    fn wrong_mask_extension_is_rejected() {
        let f = fixture();
        let bad = f.dir.path().join("mask.png");
        fs::write(&bad, b"png").unwrap();
        let text = with_value(
            &render(&sample(&f)),
            ParamField::Mask,
            &bad.display().to_string(),
        );
        assert!(matches!(
            parse(&text),
            Err(ValidationError::BadExtension {
                field: ParamField::Mask,
                ..
            })
        ));
    }

    #[test]
    fn missing_key_is_reported() {
        let f = fixture();
        let text: String = render(&sample(&f))
            .lines()
            .filter(|l| !l.starts_with(ParamField::XUnit.key()))
            .map(|l| format!("{l}\n"))
            .collect();
        assert_eq!(
            parse(&text),
            Err(ValidationError::MissingField {
                field: ParamField::XUnit
            })
        );
    }

    #[test]
    fn header_documents_every_field() {
        let f = fixture();
        let text = render(&sample(&f));
        let (header, _) = text.split_once(SETUP_MARKER).unwrap();
        for field in ParamField::ALL {
            assert!(
                header.contains(&format!("# - {}: ", field.key())),
                "{field} is not described"
            );
        }
        assert!(header.contains("Poni file: instrument geometry"));
        assert!(header.contains("Automask pixel value: pixels with intensity below"));
    }

    #[test]
    fn save_and_load_through_disk() {
        let f = fixture();
        let p = sample(&f);
        let path = f.dir.path().join("GuidedIntegration_test.int");
        save(&path, &p).unwrap();
        save(&path, &p).unwrap();
        assert_eq!(load(&path).unwrap(), p);
    }
}
