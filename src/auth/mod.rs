//! Authentication for the GitHub API.

use crate::errors::{CollectorError, CollectorErrorKind, CollectorResult};
use secrecy::{ExposeSecret, SecretString};

/// Authentication method for the GitHub API.
#[derive(Debug, Clone)]
pub enum AuthMethod {
    /// Personal Access Token (classic or fine-grained).
    Pat(SecretString),
    /// GitHub Actions token (from GITHUB_TOKEN).
    Actions(SecretString),
}

impl AuthMethod {
    /// Creates a PAT authentication method.
    pub fn pat(token: impl Into<String>) -> Self {
        Self::Pat(SecretString::new(token.into()))
    }

    /// Creates a GitHub Actions token authentication method.
    pub fn actions(token: impl Into<String>) -> Self {
        Self::Actions(SecretString::new(token.into()))
    }

    /// Gets the token prefix for logging.
    pub fn token_prefix(&self) -> &'static str {
        match self {
            Self::Pat(t) => {
                let exposed = t.expose_secret();
                if exposed.starts_with("ghp_") {
                    "ghp_***"
                } else if exposed.starts_with("github_pat_") {
                    "github_pat_***"
                } else {
                    "***"
                }
            }
            Self::Actions(_) => "ghs_***",
        }
    }

    fn token(&self) -> &SecretString {
        match self {
            Self::Pat(t) | Self::Actions(t) => t,
        }
    }
}

/// Produces the fixed `Authorization` header value for every request.
#[derive(Debug, Clone)]
pub struct AuthManager {
    method: AuthMethod,
}

impl AuthManager {
    /// Creates a new authentication manager.
    pub fn new(method: AuthMethod) -> Self {
        Self { method }
    }

    /// Gets the authentication method.
    pub fn method(&self) -> &AuthMethod {
        &self.method
    }

    /// Gets the `Authorization` header value.
    pub fn auth_header(&self) -> CollectorResult<String> {
        let token = self.method.token().expose_secret();
        if token.trim().is_empty() {
            return Err(CollectorError::new(
                CollectorErrorKind::MissingAuth,
                "Authentication token is empty",
            ));
        }
        Ok(format!("Bearer {}", token))
    }
}
