use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Credential rejected: {0}")]
    InvalidCredential(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Identity service did not answer within {0:?}")]
    Timeout(std::time::Duration),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl IdentityError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            400 | 401 | 403 => IdentityError::InvalidCredential(truncated),
            429 => IdentityError::RateLimited,
            500..=599 => IdentityError::ServerError(truncated),
            _ => IdentityError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// The service looked at the credential and said no. Anything else is
    /// worth retrying.
    pub fn is_invalid_credential(&self) -> bool {
        matches!(self, IdentityError::InvalidCredential(_))
    }
}
