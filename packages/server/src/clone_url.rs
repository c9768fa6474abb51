//! Contract for minting an authenticated clone URL on demand.
//!
//! A real deployment implements this against its code-hosting provider's
//! installation-token API; this crate ships a static implementation for
//! self-hosted or single-tenant setups where no per-request minting is
//! needed.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CloneUrlError {
    #[error("no access to {owner}/{repo} for installation {installation_ref}")]
    NoAccess {
        owner: String,
        repo: String,
        installation_ref: i64,
    },
    #[error("repository {owner}/{repo} not found")]
    NotFound { owner: String, repo: String },
    #[error("authentication configuration invalid: {0}")]
    AuthConfigInvalid(String),
    #[error("transient error minting clone url: {0}")]
    Transient(String),
}

impl CloneUrlError {
    /// Transient failures are worth retrying; everything else is terminal.
    pub fn is_retriable(&self) -> bool {
        matches!(self, CloneUrlError::Transient(_))
    }
}

#[async_trait]
pub trait CloneUrlProvider: Send + Sync {
    async fn clone_url_for(
        &self,
        owner: &str,
        repo: &str,
        installation_ref: i64,
    ) -> Result<String, CloneUrlError>;
}

/// Builds a plain `https://github.com/<owner>/<repo>.git` URL with no
/// authentication, suitable for public repositories in single-tenant
/// deployments that don't need per-request token minting.
pub struct StaticCloneUrlProvider {
    base_url: String,
}

impl StaticCloneUrlProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl Default for StaticCloneUrlProvider {
    fn default() -> Self {
        Self::new("https://github.com")
    }
}

#[async_trait]
impl CloneUrlProvider for StaticCloneUrlProvider {
    async fn clone_url_for(
        &self,
        owner: &str,
        repo: &str,
        _installation_ref: i64,
    ) -> Result<String, CloneUrlError> {
        Ok(format!("{}/{owner}/{repo}.git", self.base_url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_provider_builds_https_url() {
        let provider = StaticCloneUrlProvider::default();
        let url = provider.clone_url_for("octocat", "hello-world", 1).await.unwrap();
        assert_eq!(url, "https://github.com/octocat/hello-world.git");
    }

    #[test]
    fn only_transient_errors_are_retriable() {
        assert!(CloneUrlError::Transient("timeout".into()).is_retriable());
        assert!(!CloneUrlError::NotFound {
            owner: "a".into(),
            repo: "b".into()
        }
        .is_retriable());
    }
}
