//! Integration through an external program.
//!
//! The program is invoked once per image:
//!
//! ```text
//! <program> --poni FILE --mask FILE --image FILE --npt N --unit UNIT --method SPLIT
//!           --error-model MODEL [--dummy VALUE] [--radial-range LO,HI] [--azimuth-range LO,HI]
//! ```
//!
//! and must print whitespace-separated columns (`x I` or `x I sigma`) on stdout. Lines
//! starting with `#` are ignored.

use super::{IntegrationEngine, IntegrationRequest, Pattern};
use crate::error::EngineError;
use crate::params::{Choice, Range};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, trace};

/// Environment variable naming the integration program.
pub const ENGINE_ENV: &str = "GI_ENGINE";

#[derive(Debug, Clone)]
pub struct ExternalEngine {
    program: PathBuf,
    extra_args: Vec<OsString>,
}

impl ExternalEngine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
        }
    }

    /// Arguments placed before the generated ones, e.g. a script path for an interpreter.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.extra_args = args.into_iter().map(Into::into).collect();
        self
    }

    fn command(
        &self,
        image: &Path,
        geometry: &Path,
        mask: &Path,
        request: &IntegrationRequest,
    ) -> Command {
        let mut cmd = Command::new(&self.program);
        // Keep terminal signals away from the child: Ctrl-C cancels between images and must
        // not kill the one being integrated.
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut cmd, 0);
        cmd.args(&self.extra_args)
            .arg("--poni")
            .arg(geometry)
            .arg("--mask")
            .arg(mask)
            .arg("--image")
            .arg(image)
            .arg("--npt")
            .arg(request.radial_points.to_string())
            .arg("--unit")
            .arg(request.x_unit.token())
            .arg("--method")
            .arg(request.split_method.token())
            .arg("--error-model")
            .arg(request.error_model.token());
        if let Some(dummy) = request.automask_threshold {
            cmd.arg("--dummy").arg(dummy.to_string());
        }
        if let Some(range) = request.radial_range {
            cmd.arg("--radial-range").arg(range_arg(range));
        }
        if let Some(range) = request.azimuthal_range {
            cmd.arg("--azimuth-range").arg(range_arg(range));
        }
        cmd
    }
}

fn range_arg(range: Range) -> String {
    format!("{},{}", range.lower, range.upper)
}

/// Check that `path` is an existing readable file, returning it as the loaded artifact.
fn readable_file(path: &Path) -> Result<PathBuf, EngineError> {
    fs::File::open(path).map_err(|source| EngineError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(path.to_path_buf())
}

impl IntegrationEngine for ExternalEngine {
    type Geometry = PathBuf;
    type Mask = PathBuf;

    fn load_geometry(&self, calibration: &Path) -> Result<PathBuf, EngineError> {
        readable_file(calibration)
    }

    fn load_mask(&self, mask: &Path) -> Result<PathBuf, EngineError> {
        readable_file(mask)
    }

    fn integrate(
        &self,
        image: &Path,
        geometry: &PathBuf,
        mask: &PathBuf,
        request: &IntegrationRequest,
    ) -> Result<Pattern, EngineError> {
        readable_file(image)?;

        let mut cmd = self.command(image, geometry, mask, request);
        debug!(?cmd, "running integration engine");
        let output = cmd.output().map_err(|source| EngineError::Unavailable {
            program: self.program.clone(),
            source,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.lines().last().unwrap_or("").trim();
            return Err(EngineError::InvalidImage {
                path: image.to_path_buf(),
                reason: if detail.is_empty() {
                    format!("engine exited with {}", output.status)
                } else {
                    detail.to_string()
                },
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        trace!(bytes = output.stdout.len(), "engine output received");
        parse_columns(&stdout)
    }
}

/// Parse `x I [sigma]` rows. Every data row must have the same column count.
fn parse_columns(text: &str) -> Result<Pattern, EngineError> {
    let mut radial = Vec::new();
    let mut intensity = Vec::new();
    let mut sigma = Vec::new();
    let mut width: Option<usize> = None;

    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let values = line
            .split_whitespace()
            .map(str::parse::<f64>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                EngineError::Failed(format!("engine output line {}: {e}", lineno + 1))
            })?;

        if !(2..=3).contains(&values.len()) || width.is_some_and(|w| w != values.len()) {
            return Err(EngineError::Failed(format!(
                "engine output line {}: expected 2 or 3 consistent columns, got {}",
                lineno + 1,
                values.len()
            )));
        }
        width = Some(values.len());
        radial.push(values[0]);
        intensity.push(values[1]);
        if let Some(s) = values.get(2) {
            sigma.push(*s);
        }
    }

    let sigma = (width == Some(3)).then_some(sigma);
    Pattern::new(radial, intensity, sigma)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ErrorModel, SplitMethod, XUnit};

    fn request() -> IntegrationRequest {
        IntegrationRequest {
            radial_points: 1000,
            x_unit: XUnit::TwoThetaDeg,
            split_method: SplitMethod::Full,
            radial_range: Some(Range::new(1.0, 12.5)),
            azimuthal_range: None,
            automask_threshold: None,
            error_model: ErrorModel::Poisson,
        }
    }

    #[test]
    fn builds_arguments_from_request() {
        let engine = ExternalEngine::new("python3").with_args(["integrate.py"]);
        let cmd = engine.command(
            Path::new("a.tif"),
            Path::new("g.poni"),
            Path::new("m.edf"),
            &request(),
        );
        let args: Vec<_> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args[0], "integrate.py");
        assert!(args.windows(2).any(|w| w == ["--npt", "1000"]));
        assert!(args.windows(2).any(|w| w == ["--radial-range", "1,12.5"]));
        assert!(!args.iter().any(|a| a == "--azimuth-range"));
        assert!(!args.iter().any(|a| a == "--dummy"));
    }

    #[test]
    fn parses_columns_and_ignores_comments() {
        let p = parse_columns("# 2th_deg I sigma\n1.0 10 0.1\n\n2.0\t20 0.2\n").unwrap();
        assert_eq!(p.radial, vec![1.0, 2.0]);
        assert_eq!(p.sigma, Some(vec![0.1, 0.2]));

        let p = parse_columns("1 2\n3 4\n").unwrap();
        assert_eq!(p.sigma, None);
    }

    #[test]
    fn rejects_inconsistent_or_garbage_output() {
        assert!(parse_columns("1 2 3\n4 5\n").is_err());
        assert!(parse_columns("1 nan? 3\n").is_err());
        assert!(parse_columns("# only a header\n").is_err());
    }

    #[test]
    fn unreadable_image_is_reported_before_spawning() {
        let engine = ExternalEngine::new("/nonexistent/engine");
        let err = engine
            .integrate(
                Path::new("/nonexistent/image.tif"),
                &PathBuf::from("g.poni"),
                &PathBuf::from("m.edf"),
                &request(),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::Unreadable { .. }));
    }

    #[cfg(unix)]
    mod subprocess {
        use super::*;
        use crate::driver::IntegrationDriver;
        use crate::error::{DriverError, FatalError};
        use crate::model::{ItemOutcome, WorkItem};
        use crate::params::{Facility, ParameterSet};
        use std::fs;
        use tempfile::TempDir;

        struct Bench {
            dir: TempDir,
            params: ParameterSet,
            item: WorkItem,
        }

        fn bench() -> Bench {
            let dir = TempDir::new().unwrap();
            let poni = dir.path().join("g.poni");
            let mask = dir.path().join("m.edf");
            let image = dir.path().join("frame_001.tif");
            fs::write(&poni, "").unwrap();
            fs::write(&mask, "").unwrap();
            fs::write(&image, b"II*\0").unwrap();
            fs::create_dir(dir.path().join("out")).unwrap();
            let params =
                ParameterSet::with_defaults(Facility::ApsSingle, dir.path().join("out"), poni, mask);
            let item = WorkItem {
                source_image: image,
                output_dir: dir.path().join("out"),
                output_stem: "frame_001".into(),
            };
            Bench { dir, params, item }
        }

        /// Run `script` through `/bin/sh` so the file never needs to be executable.
        fn shell_engine(b: &Bench, script: &str) -> ExternalEngine {
            let path = b.dir.path().join("engine.sh");
            fs::write(&path, script).unwrap();
            ExternalEngine::new("/bin/sh").with_args([path])
        }

        #[test]
        fn integrates_from_program_output() {
            let b = bench();
            let engine = shell_engine(
                &b,
                "case \"$*\" in *'--image'*'--npt 6000'*) ;; *) exit 9 ;; esac\n\
                 echo '# 2th_deg I'\n\
                 echo '1 2'\n\
                 echo '3 4'\n",
            );
            let driver = IntegrationDriver::new(engine, &b.params).unwrap();

            let outcome = driver.process(&b.item).unwrap();
            let output = b.dir.path().join("out/frame_001.xy");
            assert_eq!(outcome, ItemOutcome::Integrated { output: output.clone() });
            assert_eq!(
                fs::read_to_string(output).unwrap(),
                "#2th_deg\tI\n1.00000000\t2.00000000\n3.00000000\t4.00000000\n"
            );
        }

        #[test]
        fn non_zero_exit_fails_only_the_item() {
            let b = bench();
            let engine = shell_engine(
                &b,
                "echo 'reading frame' >&2\necho 'truncated TIFF strip' >&2\nexit 3\n",
            );
            let driver = IntegrationDriver::new(engine, &b.params).unwrap();

            match driver.process(&b.item) {
                Err(DriverError::Item(e)) => {
                    assert_eq!(e.image, b.item.source_image);
                    assert!(e.reason.ends_with("truncated TIFF strip"), "{}", e.reason);
                }
                other => panic!("expected an item error, got {other:?}"),
            }
            let leftovers: Vec<_> = fs::read_dir(b.dir.path().join("out")).unwrap().collect();
            assert!(leftovers.is_empty());
        }

        #[test]
        fn missing_program_is_fatal() {
            let b = bench();
            let driver =
                IntegrationDriver::new(ExternalEngine::new("/nonexistent/engine"), &b.params)
                    .unwrap();
            assert!(matches!(
                driver.process(&b.item),
                Err(DriverError::Fatal(FatalError::EngineUnavailable(
                    EngineError::Unavailable { .. }
                )))
            ));
        }

        #[cfg(target_os = "linux")]
        #[test]
        fn child_runs_in_its_own_process_group() {
            let b = bench();
            // Field 5 of /proc/<pid>/stat is the process group id.
            let engine = shell_engine(
                &b,
                "pgid=$(cut -d' ' -f5 /proc/$$/stat)\n\
                 if [ \"$pgid\" = \"$$\" ]; then echo '1 1'; else exit 4; fi\n",
            );
            let driver = IntegrationDriver::new(engine, &b.params).unwrap();
            assert!(matches!(
                driver.process(&b.item),
                Ok(ItemOutcome::Integrated { .. })
            ));
        }
    }
}
