//! Remote update detection through git.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, SupervisionError};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Fetch the remote and return its revision when it is ahead of HEAD.
    async fn check_update(&self) -> Result<Option<String>>;

    /// Revision currently checked out.
    async fn current_revision(&self) -> Result<String>;

    /// Move the working tree to `revision`.
    async fn apply(&self, revision: &str) -> Result<()>;
}

/// Shells out to `git` in the repository the pipeline runs from.
pub struct GitRemote {
    repo: PathBuf,
    remote: String,
    branch: String,
    timeout: Duration,
}

impl GitRemote {
    pub fn new(
        repo: impl Into<PathBuf>,
        remote: impl Into<String>,
        branch: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            repo: repo.into(),
            remote: remote.into(),
            branch: branch.into(),
            timeout,
        }
    }

    fn tracking(&self) -> String {
        format!("{}/{}", self.remote, self.branch)
    }

    /// Run git and return trimmed stdout.
    async fn git(&self, args: &[&str]) -> Result<String> {
        let command = args.first().copied().unwrap_or_default().to_string();
        debug!(repo = %self.repo.display(), ?args, "Running git");

        let output = tokio::time::timeout(
            self.timeout,
            Command::new("git")
                .args(args)
                .current_dir(&self.repo)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| SupervisionError::GitTimeout {
            command: command.clone(),
            timeout: self.timeout,
        })?
        .map_err(SupervisionError::GitIo)?;

        if !output.status.success() {
            return Err(SupervisionError::Git {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl SourceControl for GitRemote {
    async fn check_update(&self) -> Result<Option<String>> {
        self.git(&["fetch", &self.remote, &self.branch]).await?;

        let range = format!("HEAD..{}", self.tracking());
        let ahead = parse_count(&self.git(&["rev-list", "--count", &range]).await?)?;
        if ahead == 0 {
            return Ok(None);
        }

        let target = self.git(&["rev-parse", &self.tracking()]).await?;
        debug!(ahead, target = %target, "Remote is ahead");
        Ok(Some(target))
    }

    async fn current_revision(&self) -> Result<String> {
        self.git(&["rev-parse", "HEAD"]).await
    }

    async fn apply(&self, revision: &str) -> Result<()> {
        self.git(&["reset", "--hard", revision]).await.map(|_| ())
    }
}

fn parse_count(output: &str) -> Result<u64> {
    output.trim().parse().map_err(|_| SupervisionError::Git {
        command: "rev-list".to_string(),
        stderr: format!("unexpected output: {output:?}"),
    })
}

/// First seven characters, for messages.
pub fn short(revision: &str) -> &str {
    revision.get(..7).unwrap_or(revision)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_count() {
        assert_eq!(parse_count("0\n").unwrap(), 0);
        assert_eq!(parse_count("12").unwrap(), 12);
        assert!(parse_count("fatal").is_err());
    }

    #[test]
    fn test_short_revision() {
        assert_eq!(short("0123456789abcdef"), "0123456");
        assert_eq!(short("abc"), "abc");
    }

    #[tokio::test]
    async fn test_missing_repository_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let remote = GitRemote::new(
            dir.path().join("missing"),
            "origin",
            "main",
            Duration::from_secs(5),
        );
        assert!(remote.current_revision().await.is_err());
    }
}
