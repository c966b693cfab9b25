//! Event code to description lookup.
//!
//! The process-wide catalog is seeded with a fixed table and may be extended
//! through [`register`] until the first lookup. After that it is sealed.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, OnceLock};

use crate::error::{AnalyzerError, Result};

pub const UNKNOWN_EVENT: &str = "Unknown event";

const SEED: [(u32, &str); 9] = [
    (4624, "Successful user logon"),
    (4625, "Failed logon attempt"),
    (1102, "Audit log was cleared"),
    (4634, "User logoff"),
    (4776, "Credential validation failed, e.g. wrong password"),
    (7045, "A service was installed on the system"),
    (10016, "Application lacks permission to access a COM component"),
    (41, "System rebooted or shut down unexpectedly"),
    (4663, "Attempt to access an object"),
];

#[derive(Clone, Debug)]
pub struct EventCatalog {
    entries: HashMap<u32, String>,
}

impl Default for EventCatalog {
    fn default() -> Self {
        EventCatalog { entries: SEED.iter().map(|(k, v)| (*k, v.to_string())).collect() }
    }
}

impl EventCatalog {
    pub fn describe(&self, code: u32) -> &str {
        self.entries.get(&code).map(String::as_str).unwrap_or(UNKNOWN_EVENT)
    }

    pub fn len(&self) -> usize { self.entries.len() }
}

/// Catalog that accepts registrations until it is first read. `staged` turns
/// `None` under its lock when the catalog seals.
pub struct Registry {
    sealed: OnceLock<EventCatalog>,
    staged: Mutex<Option<Vec<(u32, String)>>>,
}

impl Registry {
    pub const fn new() -> Self { Registry { sealed: OnceLock::new(), staged: Mutex::new(Some(Vec::new())) } }

    pub fn register<I: IntoIterator<Item = (u32, String)>>(&self, entries: I) -> Result<()> {
        let mut staged = self.staged.lock().unwrap_or_else(|e| e.into_inner());
        match staged.as_mut() {
            Some(v) => { v.extend(entries); Ok(()) }
            None => Err(AnalyzerError::CatalogSealed),
        }
    }

    pub fn catalog(&self) -> &EventCatalog {
        self.sealed.get_or_init(|| {
            let mut cat = EventCatalog::default();
            let staged = self.staged.lock().unwrap_or_else(|e| e.into_inner()).take().unwrap_or_default();
            if !staged.is_empty() { log::debug!("Event catalog: {} registered descriptions", staged.len()); }
            cat.entries.extend(staged);
            cat
        })
    }
}

impl Default for Registry {
    fn default() -> Self { Registry::new() }
}

static GLOBAL: Registry = Registry::new();

pub fn register<I: IntoIterator<Item = (u32, String)>>(entries: I) -> Result<()> { GLOBAL.register(entries) }

pub fn describe(code: u32) -> &'static str { GLOBAL.catalog().describe(code) }

/// Reads extra descriptions from a JSON object keyed by event code. The path
/// falls back to `EVTLENS_EVENTS_PATH`, then `events.json`; a missing default
/// file is not an error.
pub fn load_catalog_file(path_opt: Option<&str>) -> Option<Vec<(u32, String)>> {
    let explicit = path_opt.map(|s| s.to_string()).or_else(|| std::env::var("EVTLENS_EVENTS_PATH").ok());
    let path = explicit.clone().unwrap_or_else(|| "events.json".to_string());
    let p = std::path::PathBuf::from(&path);
    let data = match std::fs::read(&p) {
        Ok(d) => d,
        Err(e) => { if explicit.is_some() { log::warn!("Failed to read event descriptions {}: {}", p.to_string_lossy(), e); } return None }
    };
    let raw: BTreeMap<String, String> = match serde_json::from_slice(&data) { Ok(c) => c, Err(e) => { log::warn!("Failed to parse event descriptions {}: {}", p.to_string_lossy(), e); return None } };
    Some(parse_entries(raw))
}

pub fn parse_entries(raw: BTreeMap<String, String>) -> Vec<(u32, String)> {
    let mut out = Vec::with_capacity(raw.len());
    for (k, v) in raw {
        match k.trim().parse::<u32>() {
            Ok(code) => out.push((code, v)),
            Err(_) => log::warn!("Ignoring event description with non-numeric code {:?}", k),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_codes_and_unknown_sentinel() {
        let c = EventCatalog::default();
        assert_eq!(c.describe(4624), "Successful user logon");
        assert_eq!(c.describe(41), "System rebooted or shut down unexpectedly");
        assert_eq!(c.describe(999_999), UNKNOWN_EVENT);
        assert_eq!(describe(123_456), UNKNOWN_EVENT);
    }

    #[test]
    fn registration_before_first_use_then_sealed() {
        let r = Registry::new();
        r.register(vec![(4688, "A new process was created".to_string()), (4624, "Logon".to_string())]).unwrap();
        assert_eq!(r.catalog().describe(4688), "A new process was created");
        assert_eq!(r.catalog().describe(4624), "Logon");
        assert!(matches!(r.register(vec![(1, "x".to_string())]), Err(AnalyzerError::CatalogSealed)));
        assert_eq!(r.catalog().describe(1), UNKNOWN_EVENT);
    }

    #[test]
    fn registration_racing_first_read_is_never_lost() {
        for _ in 0..50 {
            let r = Registry::new();
            let r = &r;
            std::thread::scope(|s| {
                let handles: Vec<_> = (0..4u32).map(|i| s.spawn(move || r.register(vec![(90_000 + i, format!("event {}", i))]).is_ok())).collect();
                let cat = r.catalog();
                for (i, h) in handles.into_iter().enumerate() {
                    let code = 90_000 + i as u32;
                    if h.join().unwrap() { assert_eq!(r.catalog().describe(code), format!("event {}", i)); } else { assert_eq!(cat.describe(code), UNKNOWN_EVENT); }
                }
            });
        }
    }

    #[test]
    fn catalog_file_skips_bad_codes() {
        let p = std::env::temp_dir().join("evtlens_events.json");
        std::fs::write(&p, r#"{"4688": "Process created", "abc": "nope"}"#).unwrap();
        let entries = load_catalog_file(Some(&p.to_string_lossy())).unwrap();
        assert_eq!(entries, vec![(4688, "Process created".to_string())]);
        let _ = std::fs::remove_file(&p);
    }
}
