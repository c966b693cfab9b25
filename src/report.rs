use chrono::NaiveDateTime;
use comfy_table::{ContentArrangement, Table, presets};
use serde::Serialize;

use crate::aggregator::{Distribution, FilterState, LogAggregator, Predicate, Trend, ViewRow};
use crate::collab::{ChartRenderer, TextGenerator};
use crate::error::{AnalyzerError, Result};
use crate::stats::ColumnSummary;

pub const PROMPT_SAMPLE_ROWS: usize = 1000;
const DESCRIPTION_SAMPLE_ROWS: usize = 10;

const INSTRUCTIONS: [&str; 4] = [
    "Analyze the failing applications and error messages listed above.",
    "Propose a specific fix for each error.",
    "Write step-by-step guidance that helps users deal with these errors.",
    "Assess the impact of the application errors on the system.",
];

/// Hands aggregator output to the text generator and the chart renderer.
pub struct ReportAssembler<'a> {
    generator: Option<&'a dyn TextGenerator>,
    chart: Option<&'a dyn ChartRenderer>,
}

impl<'a> ReportAssembler<'a> {
    pub fn new(generator: Option<&'a dyn TextGenerator>, chart: Option<&'a dyn ChartRenderer>) -> Self {
        ReportAssembler { generator, chart }
    }

    /// Builds the remediation prompt from at most the first 1000 view rows,
    /// the trend table, the daily average and the level distribution.
    pub fn build_analysis_prompt(sample: &[ViewRow<'_>], trend: &Trend, average_daily: u64, distribution: &Distribution) -> String {
        let mut rows = Table::new();
        rows.load_preset(presets::ASCII_MARKDOWN).set_content_arrangement(ContentArrangement::Disabled);
        rows.set_header(vec!["timestamp", "message", "level", "level_display_name", "log_name", "provider_name"]);
        for r in sample.iter().take(PROMPT_SAMPLE_ROWS) {
            let rec = r.record;
            rows.add_row(vec![
                rec.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                rec.message.replace(['\r', '\n'], " "),
                rec.level.to_string(),
                rec.level_display_name.clone(),
                rec.log_name.clone(),
                rec.provider_name.clone(),
            ]);
        }
        let mut s = String::new();
        s.push_str("Think as a system administrator. Interpret the data below and recommend fixes for the failing applications.\n\n");
        s.push_str(&format!("Data ({} of {} rows):\n{}\n\n", sample.len().min(PROMPT_SAMPLE_ROWS), sample.len(), rows));
        s.push_str(&format!("Errors over time:\n{}\n\n", trend_table(trend)));
        s.push_str(&format!("Average records per day: {}\n\n", average_daily));
        s.push_str(&format!("Distribution by {}:\n", distribution.column));
        for (k, c) in &distribution.counts { s.push_str(&format!("- {}: {}\n", k, c)); }
        s.push_str("\nPlease focus on:\n");
        for (i, line) in INSTRUCTIONS.iter().enumerate() { s.push_str(&format!("{}. {}\n", i + 1, line)); }
        s
    }

    pub fn request_remediation_report(&self, prompt: &str) -> Result<String> {
        let g = self.generator.ok_or_else(|| AnalyzerError::CollaboratorUnavailable("no text generator configured".to_string()))?;
        log::info!("Requesting remediation report ({} prompt bytes)", prompt.len());
        g.generate(prompt)
    }

    pub fn render_trend_chart(&self, trend: &Trend) -> Result<()> {
        match self.chart {
            Some(c) => c.render(&trend.buckets).map_err(|e| match e {
                AnalyzerError::CollaboratorUnavailable(m) => AnalyzerError::CollaboratorUnavailable(m),
                other => AnalyzerError::CollaboratorUnavailable(format!("chart: {}", other)),
            }),
            None => { log::debug!("No chart renderer configured"); Ok(()) }
        }
    }
}

pub fn trend_table(trend: &Trend) -> String {
    let mut t = Table::new();
    t.load_preset(presets::ASCII_MARKDOWN).set_content_arrangement(ContentArrangement::Disabled);
    t.set_header(vec!["date", "count"]);
    for (d, c) in &trend.buckets { t.add_row(vec![d.format("%Y-%m-%d").to_string(), c.to_string()]); }
    t.to_string()
}

/// Everything the text and markdown outputs print.
#[derive(Clone, Debug, Serialize)]
pub struct ReportSummary {
    pub total: usize,
    pub rejected: usize,
    pub first_timestamp: Option<NaiveDateTime>,
    pub last_timestamp: Option<NaiveDateTime>,
    pub filter: Option<String>,
    pub filtered: usize,
    pub statistics: Vec<ColumnSummary>,
    pub distribution: Distribution,
    pub trend: Trend,
    pub average_daily: Option<u64>,
    pub descriptions: Vec<(u32, String)>,
    pub remediation: Option<String>,
}

impl ReportSummary {
    pub fn collect(agg: &LogAggregator) -> ReportSummary {
        let rs = agg.record_set();
        let (first, last) = match agg.first_and_last_timestamp() { Ok((a, b)) => (Some(a), Some(b)), Err(_) => (None, None) };
        let filter = match agg.state() {
            FilterState::Unfiltered => None,
            FilterState::Filtered(Predicate::ColumnEquals { column, value }) => Some(format!("{} == {}", column, value)),
            FilterState::Filtered(Predicate::MessageMatches(p)) => Some(format!("message ~ {}", p)),
        };
        ReportSummary {
            total: rs.len(),
            rejected: rs.rejected(),
            first_timestamp: first,
            last_timestamp: last,
            filter,
            filtered: agg.view_len(),
            statistics: agg.summary_statistics().unwrap_or_default(),
            distribution: agg.level_distribution(),
            trend: agg.trend_by_date(),
            average_daily: agg.average_daily_count().ok(),
            descriptions: agg.view().take(DESCRIPTION_SAMPLE_ROWS).map(|r| (r.record.level, r.event_description.unwrap_or("").to_string())).collect(),
            remediation: None,
        }
    }
}

fn ts(t: Option<NaiveDateTime>) -> String { t.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string()).unwrap_or_else(|| "n/a".to_string()) }

pub fn render_markdown(rep: &ReportSummary) -> String {
    let mut s = String::new();
    s.push_str("# Event Log Report\n\n");
    s.push_str(&format!("First record: {}\n", ts(rep.first_timestamp)));
    s.push_str(&format!("Last record: {}\n\n", ts(rep.last_timestamp)));

    s.push_str("## Summary\n");
    s.push_str(&format!("- Total records: {}\n", rep.total));
    if rep.rejected > 0 { s.push_str(&format!("- Rejected rows: {}\n", rep.rejected)); }
    if let Some(f) = rep.filter.as_ref() { s.push_str(&format!("- Filter: {}\n", f)); }
    s.push_str(&format!("- Filtered records: {}\n", rep.filtered));
    match rep.average_daily { Some(a) => s.push_str(&format!("- Average records per day: {}\n\n", a)), None => s.push_str("- Average records per day: n/a\n\n") }

    if !rep.statistics.is_empty() {
        s.push_str("## Statistics\n");
        s.push_str("| column | count | mean | std | min | 25% | 50% | 75% | max |\n|---|---|---|---|---|---|---|---|---|\n");
        for c in &rep.statistics {
            let std = c.std.map(|v| format!("{:.2}", v)).unwrap_or_else(|| "n/a".to_string());
            s.push_str(&format!("| {} | {} | {:.2} | {} | {} | {} | {} | {} | {} |\n", c.column, c.count, c.mean, std, c.min, c.q25, c.q50, c.q75, c.max));
        }
        s.push('\n');
    }

    s.push_str("## Levels\n");
    if rep.distribution.counts.is_empty() { s.push_str("None\n\n"); } else { for (k, c) in &rep.distribution.counts { s.push_str(&format!("- {} ({})\n", k, c)); } s.push('\n'); }

    s.push_str("## Trend\n");
    if rep.trend.is_empty() { s.push_str("None\n\n"); } else { for (d, c) in &rep.trend.buckets { s.push_str(&format!("- {}  {}\n", d.format("%Y-%m-%d"), c)); } s.push('\n'); }

    if rep.descriptions.iter().any(|(_, d)| !d.is_empty()) {
        s.push_str("## Event Descriptions\n");
        for (l, d) in &rep.descriptions { s.push_str(&format!("- {}: {}\n", l, d)); }
        s.push('\n');
    }

    if let Some(r) = rep.remediation.as_ref() {
        s.push_str("## Remediation\n");
        s.push_str(r.trim_end());
        s.push('\n');
    }
    s
}
