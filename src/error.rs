use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("request failed: {0}")]
    Fetch(String),

    #[error("http {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("sheet export unavailable: {0}")]
    SheetUnavailable(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("external tool is missing: {tool}")]
    ExternalToolMissing { tool: String },

    #[error("external tool failed: {tool} (code={code:?}) {stderr}")]
    ExternalToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("run canceled")]
    Canceled,
}

pub type Result<T> = std::result::Result<T, EngineError>;
