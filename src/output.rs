use crate::engine::RunSummary;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::io::{self, Write};

/// Lines of the narrative echoed to the console
pub const SUMMARY_PREVIEW_LINES: usize = 15;

/// Output format options
#[derive(Debug, Clone, Copy, ValueEnum, Serialize, Deserialize)]
pub enum OutputFormat {
    Plain,
    Json,
}

/// Print the run summary in the specified format
pub fn print_summary(summary: &RunSummary, format: OutputFormat) {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let result = match format {
        OutputFormat::Plain => write_plain(&mut out, summary),
        OutputFormat::Json => write_json(&mut out, summary),
    };
    if let Err(e) = result {
        eprintln!("Error printing run summary: {}", e);
    }
}

fn write_plain(out: &mut dyn Write, summary: &RunSummary) -> io::Result<()> {
    writeln!(out, "=== Evaluation run ===")?;
    writeln!(out, "Experiment: {}", summary.exp_root.display())?;
    writeln!(out, "Loop type:  {}", summary.loop_type)?;
    writeln!(out, "Items:      {}", summary.items)?;
    writeln!(out)?;

    if summary.records_by_type.is_empty() {
        writeln!(out, "No comparisons were planned.")?;
    } else {
        writeln!(out, "{:<14} {:>8}", "Comparison", "Records")?;
        writeln!(out, "{}", "-".repeat(23))?;
        for (kind, count) in &summary.records_by_type {
            writeln!(out, "{:<14} {:>8}", kind.as_str(), count)?;
        }
        writeln!(out)?;
    }

    let total = summary.total_records();
    let share = if total == 0 {
        0.0
    } else {
        summary.valid_records as f64 * 100.0 / total as f64
    };
    writeln!(
        out,
        "Valid ratings: {}/{} ({:.1}%), unavailable: {}",
        summary.valid_records, total, share, summary.defaulted_records
    )?;

    for path in &summary.files_written {
        writeln!(out, "  wrote {}", path.display())?;
    }
    Ok(())
}

fn write_json(out: &mut dyn Write, summary: &RunSummary) -> io::Result<()> {
    let json = serde_json::to_string_pretty(summary).map_err(io::Error::other)?;
    writeln!(out, "{}", json)
}

/// First lines of a narrative, for console preview
pub fn preview(text: &str) -> String {
    text.lines()
        .take(SUMMARY_PREVIEW_LINES)
        .collect::<Vec<_>>()
        .join("\n")
}
