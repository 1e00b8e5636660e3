use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("external tool is missing: {tool}")]
    ExternalToolMissing { tool: String },

    #[error("external tool could not start: {tool}: {source}")]
    ExternalToolSpawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("external tool failed: {tool} (code={code:?}) {stderr}")]
    ExternalToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("external tool timed out: {tool} after {secs}s")]
    ExternalToolTimedOut { tool: String, secs: u64 },

    #[error("download failed with accelerator ({accelerated}); retry without accelerator failed: {plain}")]
    RetryExhausted { accelerated: String, plain: String },

    #[error("download canceled")]
    Canceled,

    #[error("tool install failed: {0}")]
    InstallFailed(String),

    #[error("upstream service failed: {0}")]
    Upstream(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl EngineError {
    /// Whether a failed accelerated attempt may be repeated once without the accelerator.
    pub fn allows_plain_retry(&self) -> bool {
        matches!(
            self,
            EngineError::ExternalToolFailed { .. } | EngineError::ExternalToolTimedOut { .. }
        )
    }

    pub fn is_spawn_failure(&self) -> bool {
        matches!(
            self,
            EngineError::ExternalToolMissing { .. } | EngineError::ExternalToolSpawn { .. }
        )
    }

    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::InvalidRequest(_) => 400,
            EngineError::NotFound { .. } => 404,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
