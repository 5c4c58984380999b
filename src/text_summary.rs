//! Text summary builder for CLI output.
//!
//! Formats human-readable lines for the end of a batch and for dry runs.

use guided_integration::model::BatchSummary;
use guided_integration::params::ParameterSet;
use guided_integration::resolver::Resolution;
use std::time::Duration;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

fn settings_line(params: &ParameterSet) -> String {
    format!(
        "Facility: {}  Unit: {}  Points: {}  Split: {}  Errors: {}",
        params.facility,
        params.x_unit,
        params.radial_points,
        params.split_method,
        params.error_model
    )
}

/// Whole milliseconds, so the humantime rendering stays short.
fn round_ms(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}

/// Build the end-of-batch summary.
pub(crate) fn build_text_summary(summary: &BatchSummary, params: &ParameterSet) -> TextSummary {
    let mut lines = vec![settings_line(params)];

    lines.push(format!(
        "Integrated: {}  Skipped: {}  Failed: {}  (of {} images)",
        summary.succeeded, summary.skipped, summary.failed, summary.total
    ));
    if summary.cancelled {
        lines.push(format!(
            "Cancelled after {} of {} images",
            summary.processed(),
            summary.total
        ));
    }
    lines.push(format!(
        "Elapsed: {}",
        humantime::format_duration(round_ms(summary.elapsed))
    ));
    lines.push(format!("Run record: {}", summary.record_path.display()));

    if !summary.failures.is_empty() {
        lines.push("Failures:".to_string());
        for failure in &summary.failures {
            lines.push(format!("  {}: {}", failure.image.display(), failure.reason));
        }
    }

    TextSummary { lines }
}

/// Describe what a batch would process without integrating anything.
pub(crate) fn build_dry_run_summary(resolution: &Resolution, params: &ParameterSet) -> TextSummary {
    let mut lines = vec![settings_line(params)];
    for source in &resolution.sources {
        lines.push(format!(
            "{} -> {} ({} images)",
            source.source_dir.display(),
            params.output_root.join(&source.output_name).display(),
            source.images.len()
        ));
    }
    for skipped in &resolution.skipped {
        lines.push(format!("skipped: {}", skipped.display()));
    }
    lines.push(format!(
        "{} images in {} directories",
        resolution.image_count(),
        resolution.sources.len()
    ));
    TextSummary { lines }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guided_integration::model::{ItemOutcome, RunStatus};
    use guided_integration::params::Facility;
    use std::path::{Path, PathBuf};

    #[test]
    fn summary_lists_failures_and_cancellation() {
        let params =
            ParameterSet::with_defaults(Facility::Ssrl, "/out", "/cal/g.poni", "/cal/m.edf");
        let mut summary = BatchSummary::new(3, PathBuf::from("/out/run.rec"));
        summary.tally(
            Path::new("/data/a.tif"),
            &ItemOutcome::Failed {
                reason: "truncated".into(),
            },
        );
        summary.cancelled = true;
        summary.status = RunStatus::Cancelled;
        summary.elapsed = Duration::from_micros(2_500_700);

        let text = build_text_summary(&summary, &params).lines.join("\n");
        assert!(text.contains("Facility: SSRL"));
        assert!(text.contains("Failed: 1"));
        assert!(text.contains("Cancelled after 1 of 3 images"));
        assert!(text.contains("Elapsed: 2s 500ms"));
        assert!(text.contains("  /data/a.tif: truncated"));
    }
}
