/// How a failed upstream call should be handled.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FailureClass {
    /// Connectivity or server-side failure; safe to retry.
    Transient,
    /// Client-side failure; retrying cannot help. Logged and dropped.
    Terminal,
    /// The target is already gone.
    NotFound,
}

/// Implemented by each upstream-call wrapper so callers branch on a closed
/// enum rather than downcasting heterogeneous error types.
pub trait ClassifyFailure {
    fn classify(&self) -> FailureClass;

    fn is_not_found(&self) -> bool {
        self.classify() == FailureClass::NotFound
    }
}

impl ClassifyFailure for kube::Error {
    fn classify(&self) -> FailureClass {
        match self {
            kube::Error::Api(status) if status.code == 404 || status.code == 410 => {
                FailureClass::NotFound
            }
            kube::Error::Api(status) if status.code == 429 || status.code >= 500 => {
                FailureClass::Transient
            }
            kube::Error::Api(_) => FailureClass::Terminal,
            kube::Error::SerdeError(_) | kube::Error::BuildRequest(_) => FailureClass::Terminal,
            // Everything else is transport-level (connection resets, TLS,
            // protocol errors) and worth retrying.
            _ => FailureClass::Transient,
        }
    }
}
