use relaydl_exec::FetchError;
use relaydl_policy::Denial;

/// Failures of one request. Each is reported to the user and never escapes
/// the handler.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("access denied: {0:?}")]
    AccessDenied(Denial),

    #[error("no results for the query")]
    ResolutionFailed,

    #[error("fetch failed: {0}")]
    FetchFailed(#[from] FetchError),

    #[error("delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("no pending request for this choice")]
    StaleSession,
}

impl RelayError {
    pub fn user_message(&self) -> String {
        match self {
            RelayError::AccessDenied(denial) => denial.message(),
            RelayError::ResolutionFailed => {
                "❌ No results found. Try another name or send a direct link.".to_string()
            }
            RelayError::FetchFailed(e) => format!("❌ Download failed: {}", e),
            RelayError::DeliveryFailed(e) => format!("❌ Could not send the file: {}", e),
            RelayError::StaleSession => {
                "❌ That link is no longer available. Please send it again.".to_string()
            }
        }
    }
}
