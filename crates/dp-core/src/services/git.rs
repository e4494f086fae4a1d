use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{PlatformError, Result};

/// Access to project sources.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Commit hash the remote's HEAD currently points at.
    async fn latest_commit(&self, url: &str) -> Result<String>;

    /// Shallow-clone `url` into `target` (which must not exist yet).
    async fn clone_repo(&self, url: &str, target: &Path) -> Result<()>;

    /// Commit hash checked out in a local clone.
    async fn head_commit(&self, repo: &Path) -> Result<String>;
}

/// Remote URL forms `git` is allowed to fetch from.
const GIT_URL_PREFIXES: &[&str] = &["https://", "http://", "ssh://", "git@"];

/// Accept only network remotes. Anything else could reach local paths or be
/// read by `git` as an option.
pub fn validate_git_url(git_url: &str) -> Result<()> {
    if git_url.starts_with('-') || git_url.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(PlatformError::Validation(format!("invalid Git URL '{git_url}'")));
    }
    if !GIT_URL_PREFIXES.iter().any(|prefix| git_url.starts_with(prefix)) {
        return Err(PlatformError::Validation(format!(
            "Git URL must start with one of {}",
            GIT_URL_PREFIXES.join(", ")
        )));
    }
    Ok(())
}

/// [`SourceFetcher`] backed by the `git` binary.
pub struct GitCli {
    timeout: Duration,
}

impl GitCli {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

async fn run_git(args: &[&str], working_directory: Option<&Path>, limit: Duration) -> Result<String> {
    let mut cmd = Command::new("git");
    cmd.args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .kill_on_drop(true);
    if let Some(dir) = working_directory {
        cmd.current_dir(dir);
    }
    let output = tokio::time::timeout(limit, cmd.output())
        .await
        .map_err(|_| {
            PlatformError::Git(format!("git {} timed out after {}s", args[0], limit.as_secs()))
        })?
        .map_err(|e| PlatformError::Git(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PlatformError::Git(format!(
            "git {} failed (exit {}): {}",
            args[0],
            output.status.code().unwrap_or(-1),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[async_trait]
impl SourceFetcher for GitCli {
    async fn latest_commit(&self, url: &str) -> Result<String> {
        let output = run_git(&["ls-remote", "--", url, "HEAD"], None, self.timeout).await?;
        parse_ls_remote(&output)
            .ok_or_else(|| PlatformError::Git(format!("remote {url} did not report a HEAD commit")))
    }

    async fn clone_repo(&self, url: &str, target: &Path) -> Result<()> {
        let target = target.to_string_lossy();
        run_git(&["clone", "--depth", "1", "--", url, &target], None, self.timeout).await?;
        Ok(())
    }

    async fn head_commit(&self, repo: &Path) -> Result<String> {
        run_git(&["rev-parse", "HEAD"], Some(repo), self.timeout).await
    }
}

/// First hash of `git ls-remote` output (`<hash>\tHEAD`).
pub fn parse_ls_remote(output: &str) -> Option<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .find(|hash| hash.len() >= 7 && hash.bytes().all(|b| b.is_ascii_hexdigit()))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ls_remote_head() {
        let out = "3f2a9c1d8e7b6a5f4e3d2c1b0a9f8e7d6c5b4a39\tHEAD\n";
        assert_eq!(
            parse_ls_remote(out).as_deref(),
            Some("3f2a9c1d8e7b6a5f4e3d2c1b0a9f8e7d6c5b4a39")
        );
        assert_eq!(parse_ls_remote(""), None);
        assert_eq!(parse_ls_remote("warning: redirecting to x\n"), None);
    }

    #[test]
    fn only_network_remotes_are_accepted() {
        assert!(validate_git_url("https://github.com/alice/shop.git").is_ok());
        assert!(validate_git_url("ssh://git@host/alice/shop.git").is_ok());
        assert!(validate_git_url("git@github.com:alice/shop.git").is_ok());
        for bad in [
            "--upload-pack=touch /tmp/pwned",
            "-oProxyCommand=id",
            "file:///etc",
            "/srv/repos/shop",
            "ext::sh -c id",
            "https://host/a b",
        ] {
            assert!(
                matches!(validate_git_url(bad), Err(PlatformError::Validation(_))),
                "{bad}"
            );
        }
    }

    #[tokio::test]
    async fn option_shaped_urls_never_reach_git_as_options() {
        let scratch = tempfile::tempdir().unwrap();
        let marker = scratch.path().join("marker");
        let url = format!("--upload-pack=touch {}", marker.display());
        let cli = GitCli::new(Duration::from_secs(30));

        assert!(cli.latest_commit(&url).await.is_err());
        assert!(cli.clone_repo(&url, &scratch.path().join("clone")).await.is_err());
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn clones_a_local_repository() {
        let origin = tempfile::tempdir().unwrap();
        let git = |args: &[&str]| {
            let status = std::process::Command::new("git")
                .args(args)
                .current_dir(origin.path())
                .status();
            status.map(|s| s.success()).unwrap_or(false)
        };
        // Environments without git skip this test.
        if !git(&["init", "-q"]) {
            return;
        }
        std::fs::write(origin.path().join("package.json"), "{}").unwrap();
        assert!(git(&["add", "."]));
        assert!(git(&[
            "-c",
            "user.name=t",
            "-c",
            "user.email=t@t",
            "commit",
            "-q",
            "-m",
            "init"
        ]));

        let cli = GitCli::new(Duration::from_secs(30));
        let url = format!("file://{}", origin.path().display());
        let remote_head = cli.latest_commit(&url).await.unwrap();

        let work = tempfile::tempdir().unwrap();
        let target = work.path().join("clone");
        cli.clone_repo(&url, &target).await.unwrap();
        assert!(target.join("package.json").exists());
        assert_eq!(cli.head_commit(&target).await.unwrap(), remote_head);
    }
}
