use crate::aggregate::{GroupKey, RatingsTable, StabilityRow, TidyRow, report_missing_groups};
use crate::models::ComparisonType;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const CHARTS_INDEX_FILE: &str = "charts_index.json";

const WIDTH: f64 = 760.0;
const HEIGHT: f64 = 420.0;
const MARGIN_LEFT: f64 = 60.0;
const MARGIN_RIGHT: f64 = 210.0;
const MARGIN_TOP: f64 = 40.0;
const MARGIN_BOTTOM: f64 = 50.0;

const PALETTE: [&str; 10] = [
    "#1f77b4", "#ff7f0e", "#2ca02c", "#d62728", "#9467bd", "#8c564b", "#e377c2", "#7f7f7f",
    "#bcbd22", "#17becf",
];

/// Contents of `charts_index.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartsIndex {
    pub item_id: String,
    pub charts: Vec<String>,
}

/// Per-metric values over steps for one chart key; `None` marks a gap
#[derive(Debug, Clone, PartialEq)]
pub struct ChartSeries {
    pub key: GroupKey,
    pub steps: Vec<u32>,
    pub lines: BTreeMap<String, Vec<Option<f64>>>,
}

impl ChartSeries {
    /// Series for rows whose key equals `key` exactly.
    ///
    /// Every step with a record is kept; invalid scores become gaps. Several
    /// valid scores at one step are averaged. `None` when nothing is valid.
    pub fn collect(rows: &[TidyRow], key: GroupKey) -> Option<Self> {
        let matching: Vec<&TidyRow> = rows.iter().filter(|r| GroupKey::of(r) == key).collect();
        if !matching.iter().any(|r| r.valid) {
            return None;
        }

        let steps: Vec<u32> = matching
            .iter()
            .map(|r| r.step)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut sums: BTreeMap<&str, BTreeMap<u32, (f64, usize)>> = BTreeMap::new();
        for row in &matching {
            let per_step = sums.entry(row.metric.as_str()).or_default();
            let slot = per_step.entry(row.step).or_insert((0.0, 0));
            if row.valid {
                slot.0 += row.score;
                slot.1 += 1;
            }
        }

        let lines = sums
            .into_iter()
            .map(|(metric, per_step)| {
                let values = steps
                    .iter()
                    .map(|step| match per_step.get(step) {
                        Some((sum, count)) if *count > 0 => Some(sum / *count as f64),
                        _ => None,
                    })
                    .collect();
                (metric.to_string(), values)
            })
            .collect();

        Some(Self { key, steps, lines })
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.lines.values().flatten().flatten().copied()
    }
}

/// Distinct chart keys present in `rows`, sorted
pub fn chart_keys(rows: &[TidyRow]) -> Vec<GroupKey> {
    rows.iter()
        .map(GroupKey::of)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Replace characters outside `[A-Za-z0-9_.-]` with `-`
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

pub fn chart_file_name(key: &GroupKey) -> String {
    let mut base = format!("chart_{}_{}", key.comparison_type, key.anchor);
    if let Some(direction) = key.direction {
        base.push('_');
        base.push_str(direction.as_str());
    }
    format!("{}.svg", sanitize_filename(&base))
}

/// Y range for scores of unknown scale: `[0,1]`, `[0,11]`, or 5% headroom
pub fn y_domain(values: impl IntoIterator<Item = f64>) -> (f64, f64) {
    let max = values.into_iter().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() || max <= 1.0 {
        (0.0, 1.0)
    } else if max <= 10.0 {
        (0.0, 11.0)
    } else {
        (0.0, max * 1.05)
    }
}

/// Contiguous runs of present values; each run becomes one polyline
pub fn segments(steps: &[u32], values: &[Option<f64>]) -> Vec<Vec<(u32, f64)>> {
    let mut runs = Vec::new();
    let mut current = Vec::new();
    for (step, value) in steps.iter().zip(values) {
        match value {
            Some(v) => current.push((*step, *v)),
            None if !current.is_empty() => runs.push(std::mem::take(&mut current)),
            None => {}
        }
    }
    if !current.is_empty() {
        runs.push(current);
    }
    runs
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn pretty_metric(metric: &str) -> String {
    metric
        .split('_')
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Plot area mapping from data space to SVG coordinates
struct Frame {
    min_step: u32,
    max_step: u32,
    y_min: f64,
    y_max: f64,
}

impl Frame {
    fn new(steps: &[u32], domain: (f64, f64)) -> Self {
        Self {
            min_step: steps.iter().copied().min().unwrap_or(1),
            max_step: steps.iter().copied().max().unwrap_or(1),
            y_min: domain.0,
            y_max: domain.1,
        }
    }

    fn x(&self, step: u32) -> f64 {
        let plot_width = WIDTH - MARGIN_LEFT - MARGIN_RIGHT;
        if self.max_step == self.min_step {
            return MARGIN_LEFT + plot_width / 2.0;
        }
        MARGIN_LEFT
            + plot_width * f64::from(step - self.min_step) / f64::from(self.max_step - self.min_step)
    }

    fn y(&self, value: f64) -> f64 {
        let plot_height = HEIGHT - MARGIN_TOP - MARGIN_BOTTOM;
        let span = (self.y_max - self.y_min).max(f64::EPSILON);
        MARGIN_TOP + plot_height * (1.0 - (value - self.y_min) / span)
    }

    fn draw_axes(&self, svg: &mut String, title: &str, y_label: &str) -> fmt::Result {
        let bottom = HEIGHT - MARGIN_BOTTOM;
        let right = WIDTH - MARGIN_RIGHT;
        writeln!(
            svg,
            r#"<text x="{:.1}" y="24" font-size="15" text-anchor="middle">{}</text>"#,
            MARGIN_LEFT + (right - MARGIN_LEFT) / 2.0,
            escape(title)
        )?;

        for i in 0..=5 {
            let value = self.y_min + (self.y_max - self.y_min) * f64::from(i) / 5.0;
            let y = self.y(value);
            writeln!(
                svg,
                r##"<line x1="{MARGIN_LEFT}" y1="{y:.1}" x2="{right}" y2="{y:.1}" stroke="#ddd" stroke-dasharray="2,3"/><text x="{:.1}" y="{:.1}" font-size="11" text-anchor="end">{value:.1}</text>"##,
                MARGIN_LEFT - 6.0,
                y + 4.0
            )?;
        }

        for step in self.min_step..=self.max_step {
            let x = self.x(step);
            writeln!(
                svg,
                r##"<line x1="{x:.1}" y1="{bottom}" x2="{x:.1}" y2="{:.1}" stroke="#333"/><text x="{x:.1}" y="{:.1}" font-size="11" text-anchor="middle">{step}</text>"##,
                bottom + 5.0,
                bottom + 18.0
            )?;
        }

        writeln!(
            svg,
            r##"<line x1="{MARGIN_LEFT}" y1="{bottom}" x2="{right}" y2="{bottom}" stroke="#333"/><line x1="{MARGIN_LEFT}" y1="{MARGIN_TOP}" x2="{MARGIN_LEFT}" y2="{bottom}" stroke="#333"/>"##
        )?;
        writeln!(
            svg,
            r#"<text x="{:.1}" y="{:.1}" font-size="12" text-anchor="middle">Generation (step)</text>"#,
            MARGIN_LEFT + (right - MARGIN_LEFT) / 2.0,
            HEIGHT - 12.0
        )?;
        writeln!(
            svg,
            r#"<text x="16" y="{:.1}" font-size="12" text-anchor="middle" transform="rotate(-90 16 {:.1})">{}</text>"#,
            MARGIN_TOP + (bottom - MARGIN_TOP) / 2.0,
            MARGIN_TOP + (bottom - MARGIN_TOP) / 2.0,
            escape(y_label)
        )
    }
}

fn open_svg() -> String {
    format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{WIDTH}" height="{HEIGHT}" viewBox="0 0 {WIDTH} {HEIGHT}" font-family="sans-serif">
<rect width="100%" height="100%" fill="white"/>
"#
    )
}

fn legend_entry(svg: &mut String, index: usize, color: &str, label: &str) -> fmt::Result {
    let x = WIDTH - MARGIN_RIGHT + 16.0;
    let y = MARGIN_TOP + 10.0 + 20.0 * index as f64;
    writeln!(
        svg,
        r#"<line x1="{x:.1}" y1="{y:.1}" x2="{:.1}" y2="{y:.1}" stroke="{color}" stroke-width="2" stroke-dasharray="6,3"/><text x="{:.1}" y="{:.1}" font-size="11">{}</text>"#,
        x + 22.0,
        x + 28.0,
        y + 4.0,
        escape(label)
    )
}

/// One dashed polyline per metric and contiguous run, markers on every point
pub fn render_line_chart(title: &str, series: &ChartSeries) -> Result<String, fmt::Error> {
    let frame = Frame::new(&series.steps, y_domain(series.values()));
    let mut svg = open_svg();
    frame.draw_axes(&mut svg, title, "Score")?;

    for (index, (metric, values)) in series.lines.iter().enumerate() {
        let color = PALETTE[index % PALETTE.len()];
        for run in segments(&series.steps, values) {
            let points = run
                .iter()
                .map(|(step, value)| format!("{:.1},{:.1}", frame.x(*step), frame.y(*value)))
                .collect::<Vec<_>>()
                .join(" ");
            writeln!(
                svg,
                r#"<polyline class="series" data-metric="{}" points="{points}" fill="none" stroke="{color}" stroke-width="1.8" stroke-dasharray="6,3"/>"#,
                escape(metric)
            )?;
            for (step, value) in &run {
                writeln!(
                    svg,
                    r#"<circle cx="{:.1}" cy="{:.1}" r="3.5" fill="{color}"><title>{} step {step}: {value:.2}</title></circle>"#,
                    frame.x(*step),
                    frame.y(*value),
                    escape(metric)
                )?;
            }
        }
        legend_entry(&mut svg, index, color, &pretty_metric(metric))?;
    }

    svg.push_str("</svg>\n");
    Ok(svg)
}

/// Mean line with a ±1 std band per metric for one comparison type
pub fn render_stability_chart(
    kind: ComparisonType,
    rows: &[StabilityRow],
) -> Result<String, fmt::Error> {
    let mut by_metric: BTreeMap<&str, Vec<&StabilityRow>> = BTreeMap::new();
    for row in rows.iter().filter(|r| r.comparison_type == kind) {
        by_metric.entry(row.metric.as_str()).or_default().push(row);
    }

    let steps: Vec<u32> = by_metric
        .values()
        .flatten()
        .map(|r| r.step)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let upper = by_metric
        .values()
        .flatten()
        .map(|r| r.mean + r.std.unwrap_or(0.0));
    let frame = Frame::new(&steps, y_domain(upper));

    let mut svg = open_svg();
    frame.draw_axes(&mut svg, &format!("{kind} | stability"), "Mean score")?;

    for (index, (metric, mut points)) in by_metric.into_iter().enumerate() {
        points.sort_by_key(|r| r.step);
        let color = PALETTE[index % PALETTE.len()];

        let top = points
            .iter()
            .map(|r| format!("{:.1},{:.1}", frame.x(r.step), frame.y(r.mean + r.std.unwrap_or(0.0))));
        let bottom = points.iter().rev().map(|r| {
            format!(
                "{:.1},{:.1}",
                frame.x(r.step),
                frame.y((r.mean - r.std.unwrap_or(0.0)).max(frame.y_min))
            )
        });
        let band = top.chain(bottom).collect::<Vec<_>>().join(" ");
        writeln!(
            svg,
            r#"<polygon points="{band}" fill="{color}" fill-opacity="0.2" stroke="none"/>"#
        )?;

        let line = points
            .iter()
            .map(|r| format!("{:.1},{:.1}", frame.x(r.step), frame.y(r.mean)))
            .collect::<Vec<_>>()
            .join(" ");
        writeln!(
            svg,
            r#"<polyline points="{line}" fill="none" stroke="{color}" stroke-width="1.8"/>"#
        )?;
        legend_entry(&mut svg, index, color, &pretty_metric(metric))?;
    }

    svg.push_str("</svg>\n");
    Ok(svg)
}

/// Chart title: item id, comparison type, anchor and direction
pub fn chart_title(item_id: &str, key: &GroupKey) -> String {
    format!("{} | {}", item_id, key.label())
}

/// Render every chart of an eval folder next to its ratings files and
/// write `charts_index.json` when at least one chart was produced.
pub fn generate_charts(table: &RatingsTable) -> Result<Vec<PathBuf>> {
    let item_id = table.item_id();
    let mut written = Vec::new();
    report_missing_groups(&table.rows);

    for key in chart_keys(&table.rows) {
        let Some(series) = ChartSeries::collect(&table.rows, key) else {
            warn!("No valid data to chart for {}", key.label());
            continue;
        };
        let path = table.eval_dir.join(chart_file_name(&key));
        let svg = render_line_chart(&chart_title(&item_id, &key), &series)
            .context("Failed to render chart")?;
        std::fs::write(&path, svg)
            .with_context(|| format!("Failed to write chart: {}", path.display()))?;
        written.push(path);
    }

    if !written.is_empty() {
        write_index(&table.eval_dir, &item_id, &written)?;
    }
    info!("Generated {} charts -> {}", written.len(), table.eval_dir.display());
    Ok(written)
}

fn write_index(eval_dir: &Path, item_id: &str, charts: &[PathBuf]) -> Result<()> {
    let index = ChartsIndex {
        item_id: item_id.to_string(),
        charts: charts
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect(),
    };
    let path = eval_dir.join(CHARTS_INDEX_FILE);
    let content =
        serde_json::to_string_pretty(&index).context("Failed to serialize charts index")?;
    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write charts index: {}", path.display()))
}
