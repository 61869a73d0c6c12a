use crate::aggregate::{Aggregates, DeltaRow, RatingsTable, aggregate};
use crate::charts::{ChartSeries, chart_keys, chart_title, render_line_chart, render_stability_chart};
use anyhow::{Context, Result};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use flate2::{Compression, write::GzEncoder};
use minijinja::{Environment, Value, context};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::{info, warn};

pub const ASSETS_FILE: &str = "report_assets.json.gz";

const TEMPLATE_NAME: &str = "report.html";
const TEMPLATE: &str = include_str!("../templates/report.html");

/// Files written for one eval folder
#[derive(Debug, Clone, PartialEq)]
pub struct ReportOutput {
    pub html: PathBuf,
    pub assets: PathBuf,
}

#[derive(Serialize)]
struct EmbeddedChart {
    title: String,
    src: Value,
}

#[derive(Serialize)]
struct TypeCard {
    comparison_type: String,
    best_metric: String,
    most_volatile_metric: String,
    top_anchor: String,
}

#[derive(Serialize)]
struct DeltaView {
    item_id: String,
    comparison_type: String,
    metric: String,
    anchor: String,
    step: u32,
    prev_score: String,
    score: String,
    delta: String,
    reason: String,
}

impl From<&DeltaRow> for DeltaView {
    fn from(row: &DeltaRow) -> Self {
        let anchor = match row.direction {
            Some(direction) => format!("{} ({})", row.anchor, direction),
            None => row.anchor.to_string(),
        };
        Self {
            item_id: row.item_id.clone(),
            comparison_type: row.comparison_type.to_string(),
            metric: row.metric.clone(),
            anchor,
            step: row.step,
            prev_score: format!("{:.2}", row.prev_score),
            score: format!("{:.2}", row.score),
            delta: format!("{:.2}", row.delta),
            reason: row.reason.clone(),
        }
    }
}

fn svg_data_url(svg: &str) -> Value {
    Value::from_safe_string(format!("data:image/svg+xml;base64,{}", STANDARD.encode(svg)))
}

fn type_cards(aggregates: &Aggregates) -> Vec<TypeCard> {
    aggregates
        .by_type
        .iter()
        .map(|(kind, summary)| TypeCard {
            comparison_type: kind.to_string(),
            best_metric: format!("{} ({:.2})", summary.best_metric, summary.best_mean),
            most_volatile_metric: match (&summary.most_volatile_metric, summary.most_volatile_std) {
                (Some(metric), Some(std)) => format!("{metric} (σ {std:.2})"),
                _ => "n/a".to_string(),
            },
            top_anchor: format!("{} ({:.2})", summary.top_anchor, summary.top_anchor_mean),
        })
        .collect()
}

fn trend_charts(table: &RatingsTable) -> Result<Vec<EmbeddedChart>> {
    let item_id = table.item_id();
    chart_keys(&table.rows)
        .into_iter()
        .filter_map(|key| ChartSeries::collect(&table.rows, key).map(|series| (key, series)))
        .map(|(key, series)| {
            let title = chart_title(&item_id, &key);
            let svg = render_line_chart(&title, &series).context("Failed to render chart")?;
            Ok(EmbeddedChart {
                title,
                src: svg_data_url(&svg),
            })
        })
        .collect()
}

fn stability_charts(aggregates: &Aggregates) -> Result<Vec<EmbeddedChart>> {
    aggregates
        .stability
        .iter()
        .map(|row| row.comparison_type)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|kind| {
            let svg = render_stability_chart(kind, &aggregates.stability)
                .context("Failed to render stability chart")?;
            Ok(EmbeddedChart {
                title: format!("{kind} stability"),
                src: svg_data_url(&svg),
            })
        })
        .collect()
}

/// Render the HTML report for a loaded eval folder
pub fn render_report(table: &RatingsTable, aggregates: &Aggregates) -> Result<String> {
    let item_id = table.item_id();
    let input_files: Vec<String> = table
        .files
        .iter()
        .map(|path| path.display().to_string())
        .collect();

    let anchor_vs_metric: Vec<_> = aggregates
        .anchor_vs_metric
        .iter()
        .map(|row| {
            context! {
                comparison_type => row.comparison_type.to_string(),
                metric => row.metric,
                anchor => row.anchor.to_string(),
                mean => format!("{:.2}", row.mean),
            }
        })
        .collect();

    let deltas: Vec<DeltaView> = aggregates
        .deltas
        .iter()
        .filter(|row| row.delta != 0.0)
        .map(DeltaView::from)
        .collect();

    let trend_charts = trend_charts(table)?;
    let stability_charts = stability_charts(aggregates)?;

    let ctx = context! {
        title => format!("Drift report: {item_id}"),
        item_id => item_id,
        loop_type => aggregates.loop_type.as_str(),
        coverage => format!("{:.1}%", aggregates.coverage * 100.0),
        type_cards => type_cards(aggregates),
        missing_groups => aggregates.missing_groups.iter().map(|k| k.label()).collect::<Vec<_>>(),
        trend_charts => trend_charts,
        stability_charts => stability_charts,
        availability => aggregates.availability,
        anchor_vs_metric => anchor_vs_metric,
        deltas => deltas,
        top_drops => aggregates.top_drops.iter().map(DeltaView::from).collect::<Vec<_>>(),
        input_files => input_files,
        input_hash => table.input_hash,
        assets_name => ASSETS_FILE,
    };

    let mut env = Environment::new();
    env.add_template(TEMPLATE_NAME, TEMPLATE)
        .context("Failed to load report template")?;
    env.get_template(TEMPLATE_NAME)
        .and_then(|template| template.render(ctx))
        .context("Failed to render report")
}

/// Write the tidy table as gzip-compressed JSON
pub fn write_assets(table: &RatingsTable, path: &std::path::Path) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create assets file: {}", path.display()))?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    serde_json::to_writer(&mut encoder, &table.rows).context("Failed to serialize report assets")?;
    encoder
        .finish()
        .and_then(|mut writer| writer.flush())
        .with_context(|| format!("Failed to write assets file: {}", path.display()))
}

/// Build `output_name` and the assets dump inside the eval folder.
///
/// An eval folder without records yields `None` and writes nothing.
pub fn generate_report(
    table: &RatingsTable,
    top_n: usize,
    output_name: &str,
) -> Result<Option<ReportOutput>> {
    if table.is_empty() {
        warn!("No ratings found in {}, skipping report", table.eval_dir.display());
        return Ok(None);
    }

    let aggregates = aggregate(&table.rows, top_n);
    let html = render_report(table, &aggregates)?;

    let html_path = table.eval_dir.join(output_name);
    std::fs::write(&html_path, html)
        .with_context(|| format!("Failed to write report: {}", html_path.display()))?;

    let assets_path = table.eval_dir.join(ASSETS_FILE);
    write_assets(table, &assets_path)?;

    info!("Report written to {}", html_path.display());
    Ok(Some(ReportOutput {
        html: html_path,
        assets: assets_path,
    }))
}
