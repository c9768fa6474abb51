//! Drives `git bisect run` over a cloned repository and turns its exit-code
//! contract into a verdict.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const SENTINEL: &str = "is the first bad commit";

#[derive(Debug, Clone)]
pub struct BisectRequest {
    pub clone_url: String,
    pub good_sha: String,
    pub bad_sha: String,
    pub test_command: String,
}

#[derive(Debug, Clone)]
pub struct BisectResult {
    pub success: bool,
    pub culprit_sha: Option<String>,
    pub culprit_message: Option<String>,
    pub output_log: String,
    pub error: Option<String>,
}

/// Callback invoked once per line of subprocess output, in publish order.
pub trait LineSink: Send + Sync {
    fn on_line(&self, line: &str);
}

impl<F: Fn(&str) + Send + Sync> LineSink for F {
    fn on_line(&self, line: &str) {
        self(line)
    }
}

/// RAII guard for the scratch checkout. Removed on every exit path,
/// including early returns on error.
struct ScratchDir(PathBuf);

impl ScratchDir {
    async fn create() -> Result<Self> {
        let base = std::env::temp_dir().join(format!("bisect-{}", uuid_like()));
        fs::create_dir_all(&base)
            .await
            .context("failed to create scratch directory")?;
        Ok(Self(base))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let path = self.0.clone();
        tokio::spawn(async move {
            if let Err(e) = fs::remove_dir_all(&path).await {
                warn!(path = %path.display(), error = %e, "failed to remove scratch directory");
            }
        });
    }
}

fn uuid_like() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{nanos:x}")
}

/// Run a git bisect search for the first commit in `(good_sha, bad_sha]` that
/// fails `test_command`. `on_line` is called once per line of combined
/// stdout/stderr from clone, bisect start, and bisect run, in order.
pub async fn run_bisect(
    req: &BisectRequest,
    on_line: &dyn LineSink,
    cancel: &CancellationToken,
) -> Result<BisectResult> {
    let scratch = ScratchDir::create().await?;
    let repo_dir = scratch.path().join("repo");

    if let Err(e) = clone_repo(&req.clone_url, &repo_dir, on_line, cancel).await {
        return Ok(BisectResult {
            success: false,
            culprit_sha: None,
            culprit_message: None,
            output_log: String::new(),
            error: Some(format!("clone: {e}")),
        });
    }

    configure_identity(&repo_dir).await?;

    let mut transcript = String::new();

    if let Err(e) = run_git(&repo_dir, &["bisect", "start", &req.bad_sha, &req.good_sha])
        .await
        .map(|out| transcript.push_str(&out))
    {
        let _ = run_git(&repo_dir, &["bisect", "reset"]).await;
        return Ok(BisectResult {
            success: false,
            culprit_sha: None,
            culprit_message: None,
            output_log: transcript,
            error: Some(format!("bisect start failed: {e}")),
        });
    }

    let script_path = write_test_script(&repo_dir, &req.test_command).await?;

    let run_output = stream_subprocess(
        &repo_dir,
        "git",
        &["bisect", "run", script_path.to_str().unwrap_or("bisect_test.sh")],
        on_line,
        cancel,
    )
    .await;

    let result = match run_output {
        Ok(output) => {
            transcript.push_str(&output);
            parse_bisect_output(&transcript, &repo_dir).await
        }
        Err(e) => Err(e),
    };

    let _ = run_git(&repo_dir, &["bisect", "reset"]).await;
    let _ = fs::remove_file(&script_path).await;

    match result {
        Ok((culprit_sha, culprit_message)) => Ok(BisectResult {
            success: culprit_sha.is_some(),
            error: if culprit_sha.is_none() {
                Some("bisect did not find a culprit commit".to_string())
            } else {
                None
            },
            culprit_sha,
            culprit_message,
            output_log: transcript,
        }),
        Err(e) => Ok(BisectResult {
            success: false,
            culprit_sha: None,
            culprit_message: None,
            output_log: transcript,
            error: Some(e.to_string()),
        }),
    }
}

async fn clone_repo(
    url: &str,
    dest: &Path,
    on_line: &dyn LineSink,
    cancel: &CancellationToken,
) -> Result<()> {
    stream_subprocess(
        dest.parent().context("scratch dir has no parent")?,
        "git",
        &["clone", "--progress", url, dest.to_str().context("non-utf8 path")?],
        on_line,
        cancel,
    )
    .await?;
    Ok(())
}

async fn configure_identity(repo_dir: &Path) -> Result<()> {
    run_git(repo_dir, &["config", "user.email", "bisect@localhost"]).await?;
    run_git(repo_dir, &["config", "user.name", "bisect-dispatcher"]).await?;
    Ok(())
}

async fn write_test_script(repo_dir: &Path, test_command: &str) -> Result<PathBuf> {
    let script_path = repo_dir.join("bisect_test.sh");
    let body = format!("#!/bin/sh\nset -e\n{test_command}\n");
    let mut file = fs::File::create(&script_path)
        .await
        .context("failed to create bisect test script")?;
    file.write_all(body.as_bytes()).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&script_path).await?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms).await?;
    }

    Ok(script_path)
}

/// Run a git subcommand to completion, returning combined output. Used for
/// the short-lived bookkeeping calls (`bisect start`, `bisect reset`,
/// `config`, `log`) that don't need line-by-line streaming.
async fn run_git(repo_dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .current_dir(repo_dir)
        .args(args)
        .output()
        .await
        .with_context(|| format!("failed to spawn git {args:?}"))?;

    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );

    if !output.status.success() {
        bail!("git {args:?} exited with {}: {combined}", output.status);
    }

    Ok(combined)
}

/// Run a subcommand while streaming stdout and stderr line-by-line through
/// `on_line`, honoring cooperative cancellation by killing the child.
async fn stream_subprocess(
    cwd: &Path,
    program: &str,
    args: &[&str],
    on_line: &dyn LineSink,
    cancel: &CancellationToken,
) -> Result<String> {
    let mut child = Command::new(program)
        .current_dir(cwd)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {program} {args:?}"))?;

    let stdout = child.stdout.take().context("child has no stdout")?;
    let stderr = child.stderr.take().context("child has no stderr")?;

    let mut transcript = String::new();
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                bail!("subprocess cancelled");
            }
            line = stdout_lines.next_line() => {
                match line? {
                    Some(line) => {
                        on_line.on_line(&line);
                        transcript.push_str(&line);
                        transcript.push('\n');
                    }
                    None => break,
                }
            }
            line = stderr_lines.next_line() => {
                match line? {
                    Some(line) => {
                        on_line.on_line(&line);
                        transcript.push_str(&line);
                        transcript.push('\n');
                    }
                    None => continue,
                }
            }
        }
    }

    let status = child.wait().await.context("failed to wait for subprocess")?;
    debug!(program, ?status, "subprocess exited");

    if !status.success() && program == "git" && args.first() == Some(&"clone") {
        bail!("{program} {args:?} exited with {status}");
    }

    Ok(transcript)
}

/// Parse a bisect-run transcript for the sentinel line and resolve the
/// commit subject for the culprit.
async fn parse_bisect_output(
    transcript: &str,
    repo_dir: &Path,
) -> Result<(Option<String>, Option<String>)> {
    for line in transcript.lines() {
        if let Some(sha) = extract_culprit_sha(line) {
            let subject = run_git(repo_dir, &["log", "-1", "--pretty=%s", &sha])
                .await
                .ok()
                .map(|s| s.trim().to_string());
            return Ok((Some(sha), subject));
        }
    }
    Ok((None, None))
}

fn extract_culprit_sha(line: &str) -> Option<String> {
    if !line.contains(SENTINEL) {
        return None;
    }
    line.split_whitespace().next().map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_sha_from_sentinel_line() {
        let line = "abc1234def is the first bad commit";
        assert_eq!(extract_culprit_sha(line).unwrap(), "abc1234def");
    }

    #[test]
    fn ignores_unrelated_lines() {
        assert!(extract_culprit_sha("Bisecting: 5 revisions left to test").is_none());
    }

    #[test]
    fn extracts_sha_with_subject_suffix() {
        let line = "abc1234def is the first bad commit\ncommit abc1234def";
        assert_eq!(
            extract_culprit_sha(line.lines().next().unwrap()).unwrap(),
            "abc1234def"
        );
    }
}
