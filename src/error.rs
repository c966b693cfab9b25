use chrono::NaiveDateTime;

#[derive(Debug, thiserror::Error)]
pub enum AnalyzerError {
    #[error("missing required column(s): {}", .0.join(", "))]
    Schema(Vec<String>),

    #[error("unknown column: {0}")]
    UnknownColumn(String),

    #[error("invalid range: start {start} is after end {end}")]
    InvalidRange { start: NaiveDateTime, end: NaiveDateTime },

    #[error("dataset is empty")]
    EmptyDataset,

    #[error("collaborator unavailable: {0}")]
    CollaboratorUnavailable(String),

    #[error("event catalog is already in use; register descriptions before the first lookup")]
    CatalogSealed,

    #[error("invalid message pattern")]
    InvalidPattern(#[from] regex::Error),

    #[error("evtx read failed: {0}")]
    Evtx(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AnalyzerError>;
