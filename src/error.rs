use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    ConfigValidation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("vcs error: {0}")]
    Vcs(String),

    #[error("test runner crashed (exit code {exit_code}): {stderr}")]
    Runner { exit_code: i32, stderr: String },

    #[error("process error: {0}")]
    Process(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("llm provider error: {0}")]
    Provider(String),

    #[error("llm provider rejected request: {0}")]
    ProviderRejected(String),

    #[error("coverage error: {0}")]
    Coverage(String),

    #[error("prompt error: {0}")]
    Prompt(String),

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("state error: {0}")]
    State(String),

    #[error("decision gate error: {0}")]
    Gate(String),

    #[error("interrupted")]
    Interrupted,
}

impl Error {
    /// Infrastructure failures worth another attempt at the adapter-call level.
    ///
    /// A runner crash is deterministic (compile failure and the like), so it
    /// is handled by the controller rather than retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Process(_) | Error::Timeout(_) | Error::Provider(_) | Error::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
