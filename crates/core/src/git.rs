use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use autoforge_config::GitSettings;
use tokio::process::Command;
use tracing::debug;

/// Conservative shape for anything passed as a git ref on a command line.
fn is_safe_ref(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'/' | b'-'))
}

/// Repository-relative paths only: no absolute paths, no parent escapes.
fn is_safe_path(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('/')
        && !s.starts_with('\\')
        && !Path::new(s)
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
}

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("Invalid ref: {0}")]
    InvalidRef(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("git {command} failed (exit {exit_code}): {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("git {command} timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Failed to run git: {0}")]
    Io(#[from] std::io::Error),
}

impl GitError {
    /// Network blips and timeouts may be retried; everything else is a
    /// caller error or a repository fact.
    pub fn is_retryable(&self) -> bool {
        match self {
            GitError::Timeout { .. } => true,
            GitError::CommandFailed { stderr, .. } => {
                let s = stderr.to_lowercase();
                s.contains("could not resolve host")
                    || s.contains("connection timed out")
                    || s.contains("early eof")
                    || s.contains("remote end hung up")
            }
            _ => false,
        }
    }
}

/// One registered worktree as reported by `git worktree list --porcelain`.
#[derive(Debug, Clone)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub head: String,
    pub detached: bool,
}

/// Typed wrapper over the local git binary. Every operation takes an
/// explicit working directory and runs under a bounded timeout with a
/// scrubbed environment so repository hooks and ambient `GIT_*` state
/// cannot interfere.
#[derive(Debug, Clone)]
pub struct GitAdapter {
    settings: GitSettings,
}

impl GitAdapter {
    pub fn new(settings: GitSettings) -> Self {
        Self { settings }
    }

    async fn run(
        &self,
        cwd: &Path,
        args: &[&str],
        timeout_secs: u64,
    ) -> Result<String, GitError> {
        let label = args.join(" ");
        debug!(cwd = %cwd.display(), command = %label, "git");

        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_remove("GIT_DIR")
            .env_remove("GIT_WORK_TREE")
            .env_remove("GIT_INDEX_FILE")
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);

        let output = tokio::time::timeout(Duration::from_secs(timeout_secs), cmd.output())
            .await
            .map_err(|_| GitError::Timeout {
                command: label.clone(),
                timeout_secs,
            })??;

        if !output.status.success() {
            return Err(GitError::CommandFailed {
                command: label,
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run_local(&self, cwd: &Path, args: &[&str]) -> Result<String, GitError> {
        self.run(cwd, args, self.settings.timeout_secs).await
    }

    async fn run_network(&self, cwd: &Path, args: &[&str]) -> Result<String, GitError> {
        self.run(cwd, args, self.settings.network_timeout_secs).await
    }

    pub async fn head_sha(&self, cwd: &Path) -> Result<String, GitError> {
        let out = self.run_local(cwd, &["rev-parse", "HEAD"]).await?;
        Ok(out.trim().to_string())
    }

    pub async fn commit_count(&self, cwd: &Path) -> Result<u64, GitError> {
        let out = self
            .run_local(cwd, &["rev-list", "--count", "HEAD"])
            .await?;
        out.trim()
            .parse()
            .map_err(|_| GitError::NotFound(format!("unparseable commit count: {out}")))
    }

    /// Resolve a ref to a sha, or None if it does not exist.
    pub async fn rev_parse_verify(&self, cwd: &Path, rev: &str) -> Result<Option<String>, GitError> {
        if !is_safe_ref(rev) {
            return Err(GitError::InvalidRef(rev.to_string()));
        }
        let spec = format!("{rev}^{{commit}}");
        match self
            .run_local(cwd, &["rev-parse", "--verify", "--quiet", &spec])
            .await
        {
            Ok(out) => Ok(Some(out.trim().to_string())),
            Err(GitError::CommandFailed { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Read a file's bytes at a specific ref.
    pub async fn read_blob(&self, cwd: &Path, rev: &str, path: &str) -> Result<String, GitError> {
        if !is_safe_ref(rev) {
            return Err(GitError::InvalidRef(rev.to_string()));
        }
        if !is_safe_path(path) {
            return Err(GitError::InvalidPath(path.to_string()));
        }
        let spec = format!("{rev}:{path}");
        match self.run_local(cwd, &["show", &spec]).await {
            Ok(out) => Ok(out),
            Err(GitError::CommandFailed { stderr, .. })
                if stderr.contains("does not exist")
                    || stderr.contains("exists on disk, but not in")
                    || stderr.contains("invalid object name") =>
            {
                Err(GitError::NotFound(spec))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn diff(
        &self,
        cwd: &Path,
        base: &str,
        head: &str,
        path: Option<&str>,
    ) -> Result<String, GitError> {
        if !is_safe_ref(base) {
            return Err(GitError::InvalidRef(base.to_string()));
        }
        if !is_safe_ref(head) {
            return Err(GitError::InvalidRef(head.to_string()));
        }
        let range = format!("{base}...{head}");
        let mut args = vec!["diff", range.as_str()];
        if let Some(p) = path {
            if !is_safe_path(p) {
                return Err(GitError::InvalidPath(p.to_string()));
            }
            args.push("--");
            args.push(p);
        }
        self.run_local(cwd, &args).await
    }

    pub async fn diff_name_only(
        &self,
        cwd: &Path,
        base: &str,
        head: &str,
    ) -> Result<Vec<String>, GitError> {
        if !is_safe_ref(base) {
            return Err(GitError::InvalidRef(base.to_string()));
        }
        if !is_safe_ref(head) {
            return Err(GitError::InvalidRef(head.to_string()));
        }
        let range = format!("{base}...{head}");
        let out = self
            .run_local(cwd, &["diff", "--name-only", &range])
            .await?;
        Ok(out.lines().filter(|l| !l.is_empty()).map(String::from).collect())
    }

    pub async fn ls_files(&self, cwd: &Path) -> Result<Vec<String>, GitError> {
        let out = self.run_local(cwd, &["ls-files"]).await?;
        Ok(out.lines().filter(|l| !l.is_empty()).map(String::from).collect())
    }

    pub async fn fetch(&self, cwd: &Path, remote: &str, refs: &[&str]) -> Result<(), GitError> {
        if !is_safe_ref(remote) {
            return Err(GitError::InvalidRef(remote.to_string()));
        }
        for r in refs {
            if !is_safe_ref(r) {
                return Err(GitError::InvalidRef(r.to_string()));
            }
        }
        let mut args = vec!["fetch", remote];
        args.extend_from_slice(refs);
        self.run_network(cwd, &args).await?;
        Ok(())
    }

    pub async fn worktree_add(
        &self,
        cwd: &Path,
        path: &Path,
        rev: &str,
        detached: bool,
    ) -> Result<(), GitError> {
        if !is_safe_ref(rev) {
            return Err(GitError::InvalidRef(rev.to_string()));
        }
        let path_str = path.to_string_lossy();
        let mut args = vec!["worktree", "add"];
        if detached {
            args.push("--detach");
        }
        args.push(&path_str);
        args.push(rev);
        self.run_network(cwd, &args).await?;
        Ok(())
    }

    pub async fn worktree_remove(
        &self,
        cwd: &Path,
        path: &Path,
        force: bool,
    ) -> Result<(), GitError> {
        let path_str = path.to_string_lossy();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path_str);
        self.run_local(cwd, &args).await?;
        Ok(())
    }

    pub async fn worktree_prune(&self, cwd: &Path) -> Result<(), GitError> {
        self.run_local(cwd, &["worktree", "prune"]).await?;
        Ok(())
    }

    pub async fn worktree_list(&self, cwd: &Path) -> Result<Vec<WorktreeEntry>, GitError> {
        let out = self
            .run_local(cwd, &["worktree", "list", "--porcelain"])
            .await?;
        Ok(parse_worktree_list(&out))
    }
}

fn parse_worktree_list(porcelain: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut path: Option<PathBuf> = None;
    let mut head = String::new();
    let mut detached = false;

    for line in porcelain.lines().chain(std::iter::once("")) {
        if line.is_empty() {
            if let Some(p) = path.take() {
                entries.push(WorktreeEntry {
                    path: p,
                    head: std::mem::take(&mut head),
                    detached,
                });
            }
            detached = false;
            continue;
        }
        if let Some(rest) = line.strip_prefix("worktree ") {
            path = Some(PathBuf::from(rest));
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            head = rest.to_string();
        } else if line == "detached" {
            detached = true;
        }
    }

    entries
}
