use thiserror::Error;

/// Crate-wide error type covering the retrieval core's failure taxonomy.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("knowledge base not found: {0}")]
    KbNotFound(String),

    #[error("knowledge base inactive: {0}")]
    KbInactive(String),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Transient upstream failure (connection, timeout, 5xx, rate limit).
    #[error("{service} unavailable: {message}")]
    Upstream { service: String, message: String },

    /// Permanent upstream rejection (4xx, auth). Never retried, never counted
    /// against the breaker.
    #[error("{service} rejected the request: {message}")]
    ProviderRejected { service: String, message: String },

    #[error("circuit open for {0}")]
    CircuitOpen(String),

    /// All retrieval modalities or all providers failed.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("request deadline exceeded")]
    DeadlineExceeded,

    #[error("BM25 index corrupt for {kb_id}: {message}")]
    IndexCorrupt { kb_id: String, message: String },

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Coarse classification consumed by the resilience layer. Only `Transient`
/// failures are retried and counted toward opening a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Input,
    Transient,
    Permanent,
    CircuitOpen,
    Internal,
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::InvalidQuery(_)
            | CoreError::KbNotFound(_)
            | CoreError::KbInactive(_)
            | CoreError::DimensionMismatch { .. } => ErrorKind::Input,
            CoreError::Upstream { .. } | CoreError::DeadlineExceeded => ErrorKind::Transient,
            CoreError::ProviderRejected { .. } => ErrorKind::Permanent,
            CoreError::CircuitOpen(_) => ErrorKind::CircuitOpen,
            CoreError::ServiceUnavailable(_) | CoreError::IndexCorrupt { .. } | CoreError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Wrap a backend error as a transient upstream failure for `service`.
    pub fn upstream(service: &str, err: impl std::fmt::Display) -> Self {
        CoreError::Upstream {
            service: service.to_string(),
            message: err.to_string(),
        }
    }

    pub fn rejected(service: &str, err: impl std::fmt::Display) -> Self {
        CoreError::ProviderRejected {
            service: service.to_string(),
            message: err.to_string(),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Typed status error raised by HTTP backend clients so the resilience layer
/// can tell permanent rejections apart from transient faults.
#[derive(Debug, Error)]
#[error("{service} API error ({status}): {message}")]
pub struct ApiStatusError {
    pub service: String,
    pub status: u16,
    pub message: String,
}

impl ApiStatusError {
    pub fn new(service: &str, status: u16, message: impl Into<String>) -> Self {
        Self {
            service: service.to_string(),
            status,
            message: message.into(),
        }
    }

    /// 4xx responses are permanent, except request timeout (408) and rate
    /// limiting (429) which are transient.
    pub fn is_permanent(&self) -> bool {
        (400..500).contains(&self.status) && self.status != 408 && self.status != 429
    }
}

/// Classify a backend error: permanent API rejections become
/// `ProviderRejected`, everything else is a transient upstream failure.
pub fn classify_backend(service: &str, err: anyhow::Error) -> CoreError {
    match err.downcast_ref::<ApiStatusError>() {
        Some(status) if status.is_permanent() => CoreError::rejected(service, status),
        _ => CoreError::upstream(service, err),
    }
}
