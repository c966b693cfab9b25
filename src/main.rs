use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::{Context, bail};
use clap::{ArgAction, ColorChoice, CommandFactory, Parser, ValueEnum};
use clap_complete::Shell;
use comfy_table::{ContentArrangement, Table};
use is_terminal::IsTerminal;
use serde::{Deserialize, Serialize};

mod aggregator;
mod catalog;
mod collab;
mod error;
mod event_xml;
mod ingest;
mod record;
mod report;
mod stats;

use aggregator::{DEFAULT_EXPORT_PATH, LogAggregator};
use collab::{ChartRenderer, GeneratorConfig, HtmlChart, HttpTextGenerator, TerminalChart, TextGenerator};
use report::{ReportAssembler, ReportSummary};

static ENABLE_COLOR: OnceLock<bool> = OnceLock::new();

#[derive(Clone, Copy, Debug, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum OutputFmt { #[default] Text, Json }

#[derive(Clone, Copy, Debug, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum LogLevel { Error, Warn, Info, Debug, Trace }

#[derive(Clone, Copy, Debug, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum LogFormat { Text, Json }

#[derive(Parser, Debug, Default)]
#[command(
    name = "evtlens",
    about = "Event log aggregation and remediation reporter",
    long_about = "Loads exported event logs (CSV, NDJSON or EVTX), filters them by severity, summarizes error trends and can ask a text-generation endpoint for a remediation report.",
    after_long_help = "Examples:\n  evtlens Security.csv\n  evtlens logs/ --input-glob '*.evtx' --level Warning\n  evtlens Application.csv --filter provider_name=Application Error --md-path report.md\n  evtlens System.csv --endpoint http://localhost:11434/v1/chat/completions --model llama3 --remediate",
    color = ColorChoice::Auto
)]
struct Args {
    /// Input files or directories
    #[arg(num_args = 0..)]
    inputs: Vec<String>,
    #[arg(long, short = 'g')]
    input_glob: Option<String>,
    #[arg(long, short = 'r', default_value_t = false)]
    recursive: bool,
    /// Severity label kept by the analysis filter (default Error)
    #[arg(long, short = 'l')]
    level: Option<String>,
    #[arg(long, default_value_t = false, help = "Analyze every record instead of one severity")]
    no_level_filter: bool,
    /// COLUMN=VALUE equality filter; replaces the level filter
    #[arg(long, short = 'f')]
    filter: Option<String>,
    /// Regex on the message column; replaces the level filter
    #[arg(long = "match", short = 'm')]
    message_pattern: Option<String>,
    #[arg(long)]
    since: Option<String>,
    #[arg(long)]
    until: Option<String>,
    #[arg(long, short = 'o', value_enum, default_value = "text")]
    output: OutputFmt,
    #[arg(long, short = 'j')]
    ndjson_path: Option<String>,
    #[arg(long, default_value_t = false)]
    no_export: bool,
    #[arg(long)]
    md_path: Option<String>,
    #[arg(long)]
    chart_html: Option<String>,
    #[arg(long, default_value_t = false)]
    no_chart: bool,
    #[arg(long, default_value_t = false, help = "Request a remediation report from the text-generation endpoint")]
    remediate: bool,
    #[arg(long)]
    endpoint: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Write the analysis prompt to this file
    #[arg(long)]
    prompt_path: Option<String>,
    /// JSON file of extra event descriptions keyed by event code
    #[arg(long)]
    events: Option<String>,
    #[arg(long, short = 'C', default_value_t = false)]
    no_color: bool,
    #[arg(long, default_value_t = false)]
    force_color: bool,
    #[arg(long)]
    log_level: Option<LogLevel>,
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
    #[arg(long)]
    log_path: Option<String>,
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,
    #[arg(short = 'q', long, default_value_t = false)]
    quiet: bool,
    #[arg(long, default_value_t = false)]
    progress: bool,
    #[arg(long, value_enum)]
    completions: Option<Shell>,
    #[arg(long)]
    completions_out: Option<String>,
    #[arg(long)]
    config: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct AppConfig {
    inputs: Option<Vec<String>>,
    input_glob: Option<String>,
    recursive: Option<bool>,
    level: Option<String>,
    no_level_filter: Option<bool>,
    filter: Option<String>,
    message_pattern: Option<String>,
    output: Option<OutputFmt>,
    ndjson_path: Option<String>,
    md_path: Option<String>,
    chart_html: Option<String>,
    no_chart: Option<bool>,
    remediate: Option<bool>,
    prompt_path: Option<String>,
    events_path: Option<String>,
    log_format: Option<LogFormat>,
    log_path: Option<String>,
    progress: Option<bool>,
    generator: Option<GeneratorConfig>,
    events: Option<BTreeMap<String, String>>,
}

fn main() {
    let mut args = Args::parse();
    if let Some(sh) = args.completions {
        let mut cmd = Args::command();
        if let Some(path) = args.completions_out.as_ref() && let Ok(mut f) = std::fs::File::create(path) {
            clap_complete::generate(sh, &mut cmd, "evtlens", &mut f);
        } else {
            clap_complete::generate(sh, &mut cmd, "evtlens", &mut std::io::stdout());
        }
        return;
    }
    let cfg = load_config(args.config.as_deref());
    init_logging(&args, cfg.as_ref());
    let mut generator_cfg = GeneratorConfig::default();
    let mut extra_events: Vec<(u32, String)> = Vec::new();
    if let Some(cfg) = cfg {
        if let Some(g) = cfg.generator.clone() { generator_cfg = g; }
        if let Some(ev) = cfg.events.clone() { extra_events.extend(catalog::parse_entries(ev)); }
        apply_config(&mut args, cfg);
    }
    if let Some(e) = args.endpoint.as_ref() { generator_cfg.endpoint = Some(e.clone()); }
    if let Some(m) = args.model.as_ref() { generator_cfg.model = m.clone(); }
    if let Some(t) = args.timeout_secs { generator_cfg.timeout_secs = t; }
    let term = std::env::var("TERM").unwrap_or_default();
    let no_color_env = std::env::var_os("NO_COLOR").is_some();
    let color_default = std::io::stdout().is_terminal() && !no_color_env && term != "dumb";
    let _ = ENABLE_COLOR.set(if args.force_color { true } else { color_default && !args.no_color });
    if let Err(e) = run(&args, &generator_cfg, extra_events) {
        log::error!("{:#}", e);
        eprintln!("{} {:#}", paint("error:", "1;31"), e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&str>) -> Option<AppConfig> {
    let (p, explicit) = match path { Some(p) => (p.to_string(), true), None => ("evtlens.toml".to_string(), false) };
    let s = match std::fs::read_to_string(&p) {
        Ok(s) => s,
        Err(e) => { if explicit { eprintln!("Failed to read config {}: {}", p, e); } return None }
    };
    match toml::from_str::<AppConfig>(&s) {
        Ok(c) => Some(c),
        Err(e) => { eprintln!("Failed to parse config {}: {}", p, e); None }
    }
}

fn init_logging(args: &Args, cfg: Option<&AppConfig>) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
    if args.quiet {
        builder.filter_level(log::LevelFilter::Error);
    } else if let Some(lvl) = args.log_level {
        let f = match lvl { LogLevel::Error => log::LevelFilter::Error, LogLevel::Warn => log::LevelFilter::Warn, LogLevel::Info => log::LevelFilter::Info, LogLevel::Debug => log::LevelFilter::Debug, LogLevel::Trace => log::LevelFilter::Trace };
        builder.filter_level(f);
    } else if args.verbose > 0 {
        let f = if args.verbose >= 3 { log::LevelFilter::Trace } else if args.verbose == 2 { log::LevelFilter::Debug } else { log::LevelFilter::Info };
        builder.filter_level(f);
    }
    match args.log_format.or_else(|| cfg.and_then(|c| c.log_format)) {
        Some(LogFormat::Json) => {
            builder.format(|buf, record| {
                use std::io::Write;
                let obj = serde_json::json!({
                    "ts": chrono::Local::now().to_rfc3339(),
                    "level": record.level().to_string(),
                    "target": record.target(),
                    "msg": record.args().to_string(),
                });
                writeln!(buf, "{}", obj)
            });
        }
        Some(LogFormat::Text) => {
            builder.format(|buf, record| {
                use std::io::Write;
                writeln!(buf, "[{:<5} {}] {}", record.level(), chrono::Local::now().format("%H:%M:%S"), record.args())
            });
        }
        None => {}
    }
    if let Some(path) = args.log_path.as_ref().or_else(|| cfg.and_then(|c| c.log_path.as_ref())) {
        match std::fs::File::create(path) {
            Ok(f) => { builder.target(env_logger::Target::Pipe(Box::new(f))); }
            Err(e) => { eprintln!("Failed to open log file {}: {}", path, e); }
        }
    }
    builder.init();
}

fn apply_config(args: &mut Args, cfg: AppConfig) {
    if args.inputs.is_empty() && let Some(v) = cfg.inputs { args.inputs = v; }
    if args.input_glob.is_none() && let Some(v) = cfg.input_glob { args.input_glob = Some(v); }
    if let Some(v) = cfg.recursive { args.recursive = args.recursive || v; }
    if args.level.is_none() && let Some(v) = cfg.level { args.level = Some(v); }
    if let Some(v) = cfg.no_level_filter { args.no_level_filter = args.no_level_filter || v; }
    if args.filter.is_none() && let Some(v) = cfg.filter { args.filter = Some(v); }
    if args.message_pattern.is_none() && let Some(v) = cfg.message_pattern { args.message_pattern = Some(v); }
    if let Some(v) = cfg.output { args.output = v; }
    if args.ndjson_path.is_none() && let Some(v) = cfg.ndjson_path { args.ndjson_path = Some(v); }
    if args.md_path.is_none() && let Some(v) = cfg.md_path { args.md_path = Some(v); }
    if args.chart_html.is_none() && let Some(v) = cfg.chart_html { args.chart_html = Some(v); }
    if let Some(v) = cfg.no_chart { args.no_chart = args.no_chart || v; }
    if let Some(v) = cfg.remediate { args.remediate = args.remediate || v; }
    if args.prompt_path.is_none() && let Some(v) = cfg.prompt_path { args.prompt_path = Some(v); }
    if args.events.is_none() && let Some(v) = cfg.events_path { args.events = Some(v); }
    if let Some(v) = cfg.progress { args.progress = args.progress || v; }
}

fn run(args: &Args, generator_cfg: &GeneratorConfig, mut extra_events: Vec<(u32, String)>) -> anyhow::Result<()> {
    if let Some(entries) = catalog::load_catalog_file(args.events.as_deref()) { extra_events.extend(entries); }
    if !extra_events.is_empty() { catalog::register(extra_events).context("registering event descriptions")?; }

    if args.inputs.is_empty() { bail!("no input files given (pass paths or set `inputs` in evtlens.toml)"); }
    let paths = ingest::collect_inputs(&args.inputs, args.input_glob.as_deref(), args.recursive).context("collecting inputs")?;
    if paths.is_empty() { bail!("no readable inputs found in {}", args.inputs.join(", ")); }
    let records = ingest::load_all(&paths, args.progress).context("loading records")?;
    if records.rejected() > 0 { log::warn!("{} rows rejected during load", records.rejected()); }
    let mut agg = LogAggregator::new(records);
    let text = matches!(args.output, OutputFmt::Text);

    if text {
        match agg.first_and_last_timestamp() {
            Ok((first, last)) => {
                println!("{} {}", paint("First record:", "1"), first.format("%Y-%m-%d %H:%M:%S"));
                println!("{} {}", paint("Last record:", "1"), last.format("%Y-%m-%d %H:%M:%S"));
            }
            Err(e) => log::warn!("{}", e),
        }
        if let Ok(st) = agg.summary_statistics() { print_statistics(&st); }
        if let Ok(avg) = agg.average_daily_count() { println!("{} {}", paint("Average records per day:", "1"), avg); }
    }

    if args.since.is_some() || args.until.is_some() {
        let (lo, hi) = agg.first_and_last_timestamp().unwrap_or_default();
        let start = match args.since.as_deref() { Some(s) => record::parse_timestamp(s).with_context(|| format!("invalid --since {:?}", s))?, None => lo };
        let end = match args.until.as_deref() { Some(s) => record::parse_timestamp(s).with_context(|| format!("invalid --until {:?}", s))?, None => hi };
        let in_range = agg.filter_by_date_range(start, end)?;
        if text { println!("{} {} ({} to {})", paint("Records in range:", "1"), in_range.len(), start, end); }
    }

    let generator = HttpTextGenerator::from_config(generator_cfg)?;
    let html_chart = args.chart_html.as_ref().map(|p| HtmlChart { path: PathBuf::from(p) });
    let term_chart = TerminalChart { width: 40 };
    let chart: Option<&dyn ChartRenderer> = if args.no_chart { None } else if let Some(h) = html_chart.as_ref() { Some(h as &dyn ChartRenderer) } else if text { Some(&term_chart as &dyn ChartRenderer) } else { None };
    let assembler = ReportAssembler::new(generator.as_ref().map(|g| g as &dyn TextGenerator), chart);

    let mut remediation = None;
    if !agg.view_is_empty() {
        if text { println!("{} {}", paint("Total records:", "1"), agg.record_set().len()); }
        if let Some(f) = args.filter.as_deref() {
            let (col, val) = f.split_once('=').with_context(|| format!("--filter expects COLUMN=VALUE, got {:?}", f))?;
            agg.filter_by_column_value(col.trim(), val.trim())?;
        } else if let Some(p) = args.message_pattern.as_deref() {
            agg.filter_by_message(p)?;
        } else if !args.no_level_filter {
            agg.filter_by_level(args.level.as_deref().unwrap_or("Error"))?;
        }
        if text { println!("{} {}", paint("Filtered records:", "1"), agg.view_len()); }
        agg.map_event_descriptions();
        let distribution = agg.level_distribution();
        let trend = agg.trend_by_date();
        if text { print_distribution(&distribution); }
        let sample: Vec<_> = agg.view().take(report::PROMPT_SAMPLE_ROWS).collect();
        let prompt = ReportAssembler::build_analysis_prompt(&sample, &trend, agg.average_daily_count().unwrap_or(0), &distribution);
        if let Some(p) = args.prompt_path.as_ref() {
            std::fs::write(p, &prompt).with_context(|| format!("writing prompt to {}", p))?;
            log::info!("Prompt written: {}", p);
        }
        if args.remediate || generator.is_some() {
            match assembler.request_remediation_report(&prompt) {
                Ok(r) => remediation = Some(r),
                Err(e) => log::error!("Remediation report skipped: {}", e),
            }
        }
        if let Err(e) = assembler.render_trend_chart(&trend) { log::error!("Chart rendering failed: {}", e); }
    }

    let mut summary = ReportSummary::collect(&agg);
    summary.remediation = remediation;

    if !args.no_export {
        let p = args.ndjson_path.clone().unwrap_or_else(|| DEFAULT_EXPORT_PATH.to_string());
        match agg.export_filtered_view_to_path(&PathBuf::from(&p)) {
            Ok(n) => if text && !args.quiet { println!("{}", paint(&format!("NDJSON written: {} ({} rows)", p, n), "1;36")); },
            Err(e) => log::error!("NDJSON write failed for {}: {}", p, e),
        }
    }
    if let Some(p) = args.md_path.as_ref() {
        match std::fs::write(p, report::render_markdown(&summary)) {
            Ok(_) => if text && !args.quiet { println!("{}", paint(&format!("Markdown written: {}", p), "1;36")); },
            Err(e) => log::error!("Markdown write failed for {}: {}", p, e),
        }
    }

    match args.output {
        OutputFmt::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        OutputFmt::Text => print_text(&summary),
    }
    Ok(())
}

fn print_statistics(st: &[stats::ColumnSummary]) {
    if st.is_empty() { return; }
    println!("{}", paint("Summary statistics:", "1"));
    let mut t = Table::new();
    t.set_content_arrangement(ContentArrangement::Dynamic);
    t.set_header(vec!["column", "count", "mean", "std", "min", "25%", "50%", "75%", "max"]);
    for c in st {
        t.add_row(vec![
            c.column.clone(), c.count.to_string(), format!("{:.2}", c.mean),
            c.std.map(|v| format!("{:.2}", v)).unwrap_or_else(|| "NaN".to_string()),
            c.min.to_string(), c.q25.to_string(), c.q50.to_string(), c.q75.to_string(), c.max.to_string(),
        ]);
    }
    println!("{}", t);
}

fn print_distribution(d: &aggregator::Distribution) {
    println!("{}", paint(&format!("By {}:", d.column), "1"));
    if d.counts.is_empty() { println!("{}", paint("None", "2")); return; }
    for (k, c) in &d.counts { println!("• {} ({})", k, c); }
}

fn print_text(rep: &ReportSummary) {
    if !rep.descriptions.is_empty() {
        println!("{}", paint("Event descriptions (first rows):", "1"));
        let mut t = Table::new();
        t.set_content_arrangement(ContentArrangement::Dynamic);
        t.set_header(vec!["level", "event_description"]);
        for (l, d) in &rep.descriptions { t.add_row(vec![l.to_string(), d.clone()]); }
        println!("{}", t);
    }
    if let Some(r) = rep.remediation.as_ref() {
        println!("{}", paint("Remediation:", "1;36"));
        println!("{}", r.trim_end());
    }
}

fn paint(s: &str, code: &str) -> String {
    if *ENABLE_COLOR.get().unwrap_or(&false) { format!("\x1b[{}m{}\x1b[0m", code, s) } else { s.to_string() }
}
