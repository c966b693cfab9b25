//! External collaborators: remote text generation and trend charting.
//!
//! The report code only sees the [`TextGenerator`] and [`ChartRenderer`]
//! traits, so it can run against stubs.

use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{AnalyzerError, Result};

pub trait TextGenerator {
    fn generate(&self, prompt: &str) -> Result<String>;
}

pub trait ChartRenderer {
    fn render(&self, series: &[(NaiveDate, usize)]) -> Result<()>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Chat-completions style endpoint, e.g. `http://localhost:11434/v1/chat/completions`.
    pub endpoint: Option<String>,
    pub model: String,
    /// Name of the environment variable holding a bearer token.
    pub api_key_env: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        GeneratorConfig { endpoint: None, model: "gpt-4o-mini".to_string(), api_key_env: None, timeout_secs: 60, max_retries: 2, backoff_ms: 500 }
    }
}

pub struct HttpTextGenerator {
    client: reqwest::blocking::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    max_retries: u32,
    backoff: Duration,
}

impl HttpTextGenerator {
    /// `None` when no endpoint is configured.
    pub fn from_config(cfg: &GeneratorConfig) -> Result<Option<HttpTextGenerator>> {
        let Some(endpoint) = cfg.endpoint.clone() else { return Ok(None) };
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs.max(1)))
            .build()
            .map_err(|e| AnalyzerError::CollaboratorUnavailable(format!("http client: {}", e)))?;
        let api_key = cfg.api_key_env.as_ref().and_then(|k| std::env::var(k).ok()).filter(|v| !v.is_empty());
        Ok(Some(HttpTextGenerator { client, endpoint, model: cfg.model.clone(), api_key, max_retries: cfg.max_retries, backoff: Duration::from_millis(cfg.backoff_ms) }))
    }

    fn attempt(&self, prompt: &str) -> std::result::Result<String, (bool, String)> {
        let mut req = self.client.post(&self.endpoint).json(&chat_body(&self.model, prompt));
        if let Some(k) = self.api_key.as_ref() { req = req.bearer_auth(k); }
        let resp = req.send().map_err(|e| (true, e.to_string()))?;
        let status = resp.status();
        if !status.is_success() { return Err((is_retryable(status), format!("HTTP {}", status))); }
        let v: serde_json::Value = resp.json().map_err(|e| (false, format!("bad response body: {}", e)))?;
        extract_text(&v).ok_or_else(|| (false, "response carried no text".to_string()))
    }
}

impl TextGenerator for HttpTextGenerator {
    fn generate(&self, prompt: &str) -> Result<String> {
        let mut last = String::new();
        for n in 0..=self.max_retries {
            if n > 0 {
                let wait = backoff_delay(self.backoff, n);
                log::warn!("Text generation attempt {} failed ({}), retrying in {:?}", n, last, wait);
                std::thread::sleep(wait);
            }
            match self.attempt(prompt) {
                Ok(text) => return Ok(text),
                Err((retry, msg)) => {
                    last = msg;
                    if !retry { break; }
                }
            }
        }
        log::error!("Text generation unavailable at {}: {}", self.endpoint, last);
        Err(AnalyzerError::CollaboratorUnavailable(last))
    }
}

const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub fn chat_body(model: &str, prompt: &str) -> serde_json::Value {
    serde_json::json!({
        "model": model,
        "messages": [{ "role": "user", "content": prompt }],
    })
}

/// Server errors and 429 are worth another attempt; other statuses are final.
pub fn is_retryable(status: reqwest::StatusCode) -> bool {
    status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
}

/// Wait before retry `n` (1-based): `base * 2^(n-1)`, capped at 30 s.
pub fn backoff_delay(base: Duration, n: u32) -> Duration {
    2u32.checked_pow(n.saturating_sub(1))
        .and_then(|f| base.checked_mul(f))
        .map_or(MAX_BACKOFF, |d| d.min(MAX_BACKOFF))
}

/// Accepts OpenAI-style `choices[0].message.content` and plain `response` bodies.
pub fn extract_text(v: &serde_json::Value) -> Option<String> {
    v.pointer("/choices/0/message/content")
        .or_else(|| v.pointer("/message/content"))
        .or_else(|| v.get("response"))
        .and_then(|t| t.as_str())
        .map(|s| s.to_string())
}

pub fn bar(v: usize, max: usize, width: usize) -> String {
    if max == 0 || v == 0 { return String::new(); }
    let n = ((v as f64 / max as f64) * width as f64).ceil() as usize;
    "█".repeat(n.clamp(1, width))
}

pub fn chart_lines(series: &[(NaiveDate, usize)], width: usize) -> Vec<String> {
    let max = series.iter().map(|(_, c)| *c).max().unwrap_or(0);
    series.iter().map(|(d, c)| format!("{}  {:>6} {}", d.format("%Y-%m-%d"), c, bar(*c, max, width))).collect()
}

/// Bar chart on stdout.
pub struct TerminalChart { pub width: usize }

impl ChartRenderer for TerminalChart {
    fn render(&self, series: &[(NaiveDate, usize)]) -> Result<()> {
        println!("Error trend by date:");
        for l in chart_lines(series, self.width) { println!("{}", l); }
        Ok(())
    }
}

/// Standalone HTML page with an SVG line chart.
pub struct HtmlChart { pub path: PathBuf }

impl ChartRenderer for HtmlChart {
    fn render(&self, series: &[(NaiveDate, usize)]) -> Result<()> {
        std::fs::write(&self.path, render_html_chart(series))?;
        log::info!("Trend chart written: {}", self.path.to_string_lossy());
        Ok(())
    }
}

pub fn render_html_chart(series: &[(NaiveDate, usize)]) -> String {
    let (w, h, pad) = (960.0f64, 420.0f64, 50.0f64);
    let max = series.iter().map(|(_, c)| *c).max().unwrap_or(0).max(1) as f64;
    let step = if series.len() > 1 { (w - 2.0 * pad) / (series.len() - 1) as f64 } else { 0.0 };
    let pts: Vec<(f64, f64, &NaiveDate, usize)> = series.iter().enumerate()
        .map(|(i, (d, c))| (pad + i as f64 * step, h - pad - (*c as f64 / max) * (h - 2.0 * pad), d, *c))
        .collect();
    let mut s = String::new();
    s.push_str("<html lang=\"en\"><head><meta charset=\"utf-8\"><title>Error trend by date</title><style>");
    s.push_str("body{margin:0;background:#f7fafc;color:#111827;font-family:Segoe UI,system-ui,-apple-system,Arial,sans-serif} .container{max-width:1000px;margin:0 auto;padding:24px} .card{background:#fff;border:1px solid #e5e7eb;border-radius:10px;padding:14px} .grid line{stroke:#e5e7eb} .line{fill:none;stroke:#dc2626;stroke-width:2} .dot{fill:#dc2626} text{font-size:11px;fill:#6b7280}");
    s.push_str("</style></head><body><div class=\"container\"><h3>Error trend by date</h3><div class=\"card\">");
    s.push_str(&format!("<svg viewBox=\"0 0 {} {}\" width=\"100%\">", w, h));
    s.push_str(&format!("<g class=\"grid\"><line x1=\"{p}\" y1=\"{b}\" x2=\"{r}\" y2=\"{b}\"/><line x1=\"{p}\" y1=\"{p}\" x2=\"{p}\" y2=\"{b}\"/></g>", p = pad, b = h - pad, r = w - pad));
    s.push_str(&format!("<text x=\"{}\" y=\"{}\">{}</text>", 4.0, pad, max as usize));
    if !pts.is_empty() {
        let path: Vec<String> = pts.iter().map(|(x, y, _, _)| format!("{:.1},{:.1}", x, y)).collect();
        s.push_str(&format!("<polyline class=\"line\" points=\"{}\"/>", path.join(" ")));
    }
    for (x, y, d, c) in &pts {
        s.push_str(&format!("<circle class=\"dot\" cx=\"{:.1}\" cy=\"{:.1}\" r=\"4\"><title>{}: {}</title></circle>", x, y, d.format("%Y-%m-%d"), c));
        s.push_str(&format!("<text x=\"{:.1}\" y=\"{:.1}\" transform=\"rotate(45 {:.1},{:.1})\">{}</text>", x, h - pad + 14.0, x, h - pad + 14.0, d.format("%Y-%m-%d")));
    }
    s.push_str("</svg></div></div></body></html>");
    s
}
