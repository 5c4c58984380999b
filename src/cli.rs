use crate::text_summary::{build_dry_run_summary, build_text_summary};
use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use guided_integration::engine::{ExternalEngine, ENGINE_ENV};
use guided_integration::error::BatchError;
use guided_integration::model::{BatchControl, BatchEvent, BatchSummary};
use guided_integration::orchestrator::{process_batch_completion, BatchOptions, BatchOrchestrator};
use guided_integration::params::{
    self, Choice, ErrorModel, Facility, ParameterSet, Range, SplitMethod, XUnit,
    DEFAULT_AUTOMASK_THRESHOLD, DEFAULT_RADIAL_POINTS,
};
use guided_integration::record;
use guided_integration::resolver::DirectoryResolver;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

const PARAMS_EXTENSION: &str = "int";

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

fn parse_token<C: Choice>(value: &str) -> Result<C, String> {
    C::from_token(value).ok_or_else(|| format!("expected one of {}", C::EXPECTED))
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "guided-integration",
    version,
    about = "Batch-integrate 2D detector images into 1D patterns with a fixed calibration"
)]
pub struct Cli {
    /// Root directories to scan for images
    pub roots: Vec<PathBuf>,

    /// Load integration parameters from a .int file instead of the flags below
    #[arg(long, short = 'p')]
    pub params: Option<PathBuf>,

    /// Data layout: NSLS2, APS_single, APS_multi or SSRL
    #[arg(long, value_parser = parse_token::<Facility>, required_unless_present = "params", conflicts_with = "params")]
    pub facility: Option<Facility>,

    /// Directory that receives one output directory per source directory
    #[arg(long, required_unless_present = "params", conflicts_with = "params")]
    pub output_root: Option<PathBuf>,

    /// Calibration (.poni) file
    #[arg(long, required_unless_present = "params", conflicts_with = "params")]
    pub poni: Option<PathBuf>,

    /// Mask file (.tif, .edf, .npy or .msk)
    #[arg(long, required_unless_present = "params", conflicts_with = "params")]
    pub mask: Option<PathBuf>,

    /// Pixel splitting method
    #[arg(long, value_parser = parse_token::<SplitMethod>, default_value = "full")]
    pub split: SplitMethod,

    /// Radial unit of the output patterns
    #[arg(long, value_parser = parse_token::<XUnit>, default_value = "2th_deg")]
    pub unit: XUnit,

    /// Number of radial points
    #[arg(long, default_value_t = DEFAULT_RADIAL_POINTS)]
    pub points: usize,

    /// Radial range as "lo,hi" (default: full range)
    #[arg(long, allow_hyphen_values = true)]
    pub radial_range: Option<Range>,

    /// Azimuthal range in degrees as "lo,hi" (default: full azimuth)
    #[arg(long, allow_hyphen_values = true)]
    pub azimuthal_range: Option<Range>,

    /// Pixels below this value are masked
    #[arg(long, default_value_t = DEFAULT_AUTOMASK_THRESHOLD, allow_hyphen_values = true)]
    pub automask: f64,

    /// Disable automasking
    #[arg(long, conflicts_with = "automask")]
    pub no_automask: bool,

    /// Intensity error model (poisson writes .xye files)
    #[arg(long, value_parser = parse_token::<ErrorModel>, default_value = "none")]
    pub error_model: ErrorModel,

    /// Free-text notes stored with the parameters
    #[arg(long)]
    pub notes: Option<String>,

    /// Save the parameters as a .int file (default name in the output root)
    #[arg(long, num_args = 0..=1)]
    pub save_params: Option<Option<PathBuf>>,

    /// Run record path (default: timestamped .rec file in the output root)
    #[arg(long)]
    pub record: Option<PathBuf>,

    /// Only process subdirectories whose name contains this keyword ("ALL" for every one)
    #[arg(long)]
    pub keyword: Option<String>,

    /// Resolve directories and print the worklist without integrating
    #[arg(long)]
    pub dry_run: bool,

    /// Print the batch summary as JSON
    #[arg(long)]
    pub json: bool,

    /// Suppress progress and summary output; errors are still reported
    #[arg(long)]
    pub silent: bool,

    /// Export the batch summary as JSON
    #[arg(long)]
    pub export_json: Option<PathBuf>,

    /// Integration program invoked once per image
    #[arg(long, env = ENGINE_ENV)]
    pub engine: Option<PathBuf>,

    /// Extra argument passed to the integration program before the generated ones
    #[arg(long = "engine-arg", allow_hyphen_values = true)]
    pub engine_args: Vec<String>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Build a `ParameterSet` from a parameter file or from the flags.
pub fn build_params(args: &Cli) -> Result<ParameterSet> {
    if let Some(path) = args.params.as_deref() {
        return params::load(path);
    }

    let (Some(facility), Some(output_root), Some(poni), Some(mask)) = (
        args.facility,
        args.output_root.clone(),
        args.poni.clone(),
        args.mask.clone(),
    ) else {
        bail!("--facility, --output-root, --poni and --mask are required without --params");
    };

    let mut p = ParameterSet::with_defaults(facility, output_root, poni, mask);
    p.split_method = args.split;
    p.x_unit = args.unit;
    p.radial_points = args.points;
    p.radial_range = args.radial_range;
    p.azimuthal_range = args.azimuthal_range;
    p.automask_threshold = (!args.no_automask).then_some(args.automask);
    p.error_model = args.error_model;
    if let Some(notes) = args.notes.as_deref() {
        p.notes = format!("{notes}\n");
    }
    p.finalize().context("invalid integration parameters")
}

fn save_params(path: Option<&Path>, p: &ParameterSet) -> Result<PathBuf> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            std::fs::create_dir_all(&p.output_root)
                .with_context(|| format!("create {}", p.output_root.display()))?;
            p.output_root
                .join(record::default_file_name(PARAMS_EXTENSION))
        }
    };
    params::save(&path, p).with_context(|| format!("save parameters to {}", path.display()))?;
    Ok(path)
}

pub async fn run(args: Cli) -> Result<()> {
    if args.silent && args.json {
        bail!("--silent and --json cannot be used together");
    }

    let p = build_params(&args)?;
    let (out_tx, out_handle) = spawn_output_writer();
    let say = |line: String| {
        if !args.silent {
            let _ = out_tx.send(OutputLine::Stderr(line));
        }
    };

    if let Some(path) = args.save_params.as_ref() {
        let saved = save_params(path.as_deref(), &p)?;
        say(format!("Saved parameters: {}", saved.display()));
    }

    let result = if args.roots.is_empty() {
        if args.save_params.is_none() {
            Err(anyhow!("no root directories given"))
        } else {
            Ok(())
        }
    } else if args.dry_run {
        dry_run(&args, &p, &out_tx)
    } else {
        run_batch(&args, p, &out_tx).await
    };

    drop(out_tx);
    let _ = out_handle.await;
    result
}

fn dry_run(args: &Cli, p: &ParameterSet, out_tx: &mpsc::UnboundedSender<OutputLine>) -> Result<()> {
    let mut resolver = DirectoryResolver::new(p.facility);
    if let Some(keyword) = args.keyword.as_deref() {
        resolver = resolver.with_keyword(keyword);
    }
    let resolution = resolver
        .resolve(&args.roots)
        .context("directory resolution failed")?;
    if !args.silent {
        for line in build_dry_run_summary(&resolution, p).lines {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
    }
    Ok(())
}

async fn run_batch(
    args: &Cli,
    p: ParameterSet,
    out_tx: &mpsc::UnboundedSender<OutputLine>,
) -> Result<()> {
    let program = args.engine.clone().ok_or_else(|| {
        anyhow!("no integration engine configured; pass --engine or set {ENGINE_ENV}")
    })?;
    let engine = ExternalEngine::new(program).with_args(args.engine_args.iter());

    let options = BatchOptions {
        roots: args.roots.clone(),
        record_path: args.record.clone(),
        keyword: args.keyword.clone(),
    };
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<BatchEvent>();
    let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel::<BatchControl>();

    let run_params = p.clone();
    let handle = tokio::task::spawn_blocking(move || {
        BatchOrchestrator::new(engine).run(&run_params, options, evt_tx, ctrl_rx)
    });

    let cancel_tx = ctrl_tx.clone();
    let cancel_out = out_tx.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_out.send(OutputLine::Stderr(
                "Cancelling after the current image…".into(),
            ));
            let _ = cancel_tx.send(BatchControl::Cancel);
        }
    });

    while let Some(ev) = evt_rx.recv().await {
        if args.silent {
            continue;
        }
        if let Some(msg) = ev.to_message() {
            let _ = out_tx.send(OutputLine::Stderr(msg));
        }
    }
    ctrl_c.abort();
    drop(ctrl_tx);

    let outcome = handle.await.context("batch task failed")?;
    match outcome {
        Ok(summary) => {
            report(args, &p, &summary, out_tx)?;
            if summary.failed > 0 && args.silent {
                bail!("{} of {} images failed", summary.failed, summary.total);
            }
            Ok(())
        }
        Err(BatchError::Aborted { cause, summary }) => {
            report(args, &p, &summary, out_tx)?;
            Err(anyhow::Error::new(cause).context(format!(
                "batch aborted after {} of {} images",
                summary.processed(),
                summary.total
            )))
        }
        Err(e) => Err(e.into()),
    }
}

/// Print the summary and run exports.
fn report(
    args: &Cli,
    p: &ParameterSet,
    summary: &BatchSummary,
    out_tx: &mpsc::UnboundedSender<OutputLine>,
) -> Result<()> {
    for msg in process_batch_completion(summary, args.export_json.as_deref()) {
        if !args.silent {
            let _ = out_tx.send(OutputLine::Stderr(msg));
        }
    }
    if args.silent {
        return Ok(());
    }
    if args.json {
        let out = serde_json::to_string_pretty(summary)?;
        let _ = out_tx.send(OutputLine::Stdout(out));
    } else {
        for line in build_text_summary(summary, p).lines {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn flags_build_a_validated_parameter_set() {
        let dir = TempDir::new().unwrap();
        let poni = dir.path().join("g.poni");
        let mask = dir.path().join("m.edf");
        fs::write(&poni, "").unwrap();
        fs::write(&mask, "").unwrap();

        let args = Cli::try_parse_from([
            "guided-integration",
            "--facility",
            "aps_single",
            "--output-root",
            dir.path().join("out").to_str().unwrap(),
            "--poni",
            poni.to_str().unwrap(),
            "--mask",
            mask.to_str().unwrap(),
            "--unit",
            "q",
            "--radial-range",
            "0.5,12",
            "--no-automask",
            "/data/run7",
        ])
        .unwrap();

        let p = build_params(&args).unwrap();
        assert_eq!(p.facility, Facility::ApsSingle);
        assert_eq!(p.x_unit, XUnit::QInvAngstrom);
        assert_eq!(p.radial_range, Some(Range::new(0.5, 12.0)));
        assert_eq!(p.automask_threshold, None);
        assert_eq!(p.radial_points, DEFAULT_RADIAL_POINTS);
        assert_eq!(args.roots, vec![PathBuf::from("/data/run7")]);
    }

    #[test]
    fn params_file_conflicts_with_fresh_flags() {
        let res = Cli::try_parse_from([
            "guided-integration",
            "--params",
            "run.int",
            "--facility",
            "SSRL",
        ]);
        assert!(res.is_err());
        assert!(Cli::try_parse_from(["guided-integration", "--params", "run.int"]).is_ok());
        assert!(Cli::try_parse_from(["guided-integration", "/data"]).is_err());
    }
}
