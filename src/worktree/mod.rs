//! Worktree manager (§4.4): per-engine git worktrees, reset, branch ops.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};

/// Errors surfaced by worktree operations, prefixed `worktree:` (§7).
#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("worktree: `git {args}` failed in {dir}: {stderr}")]
    CommandFailed {
        args: String,
        dir: String,
        stderr: String,
    },

    #[error("worktree: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

const IGNORE_FILE: &str = ".claudeignore";
const IGNORE_ENTRIES: &[&str] = &["railyard.yaml", ".railyard/"];

async fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await?;

    if !output.status.success() {
        return Err(WorktreeError::CommandFailed {
            args: args.join(" "),
            dir: dir.display().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn engine_worktree_dir(repo_dir: &Path, engine_id: &str) -> PathBuf {
    repo_dir.join(".railyard").join("engines").join(engine_id)
}

fn write_ignore_file(worktree_dir: &Path) -> Result<()> {
    let contents = IGNORE_ENTRIES.join("\n") + "\n";
    std::fs::write(worktree_dir.join(IGNORE_FILE), contents)?;
    Ok(())
}

/// Idempotently create (if absent) a detached-HEAD worktree for `engine_id`
/// under `<repo_dir>/.railyard/engines/<engine_id>` (§4.4 `EnsureWorktree`).
pub async fn ensure_worktree(repo_dir: &Path, engine_id: &str) -> Result<PathBuf> {
    let dir = engine_worktree_dir(repo_dir, engine_id);

    if !dir.exists() {
        info!(engine_id, dir = %dir.display(), "creating worktree");
        run_git(
            repo_dir,
            &[
                "worktree",
                "add",
                "--detach",
                dir.to_str().unwrap_or_default(),
            ],
        )
        .await?;
    }

    write_ignore_file(&dir)?;
    Ok(dir)
}

/// Deterministic base-branch fallback chain (§4.4 `DetectBaseBranch`):
/// current symbolic HEAD → `config_default` → `origin/HEAD` target → `main`.
pub async fn detect_base_branch(repo_dir: &Path, config_default: Option<&str>) -> Result<String> {
    if let Ok(head) = run_git(repo_dir, &["symbolic-ref", "--short", "HEAD"]).await {
        if !head.is_empty() {
            return Ok(head);
        }
    }

    if let Some(default) = config_default {
        return Ok(default.to_string());
    }

    if let Ok(origin_head) = run_git(
        repo_dir,
        &["symbolic-ref", "refs/remotes/origin/HEAD"],
    )
    .await
    {
        if let Some(branch) = origin_head.strip_prefix("refs/remotes/origin/") {
            return Ok(branch.to_string());
        }
    }

    Ok("main".to_string())
}

/// Fetch (best-effort), detach, wipe untracked state, and hard-reset to the
/// base branch. Must run before every new car (§4.4 `ResetWorktree`).
pub async fn reset_worktree(worktree_dir: &Path, base_branch: &str) -> Result<()> {
    if let Err(e) = run_git(worktree_dir, &["fetch", "origin"]).await {
        warn!(dir = %worktree_dir.display(), error = %e, "fetch origin failed, continuing with local refs");
    }

    run_git(worktree_dir, &["checkout", "--detach"]).await?;
    run_git(worktree_dir, &["clean", "-ffdx"]).await?;

    for target in [
        format!("origin/{base_branch}"),
        base_branch.to_string(),
        "main".to_string(),
    ] {
        if run_git(worktree_dir, &["reset", "--hard", &target])
            .await
            .is_ok()
        {
            return Ok(());
        }
    }

    Err(WorktreeError::CommandFailed {
        args: "reset --hard".to_string(),
        dir: worktree_dir.display().to_string(),
        stderr: format!("no ref resolved for base branch {base_branch}"),
    })
}

/// Create (or switch to) a branch in the given worktree.
pub async fn create_branch(worktree_dir: &Path, branch_name: &str) -> Result<()> {
    if run_git(worktree_dir, &["checkout", branch_name])
        .await
        .is_ok()
    {
        return Ok(());
    }
    run_git(worktree_dir, &["checkout", "-b", branch_name]).await?;
    Ok(())
}

/// Push `branch_name` to origin, retrying once after a short delay (§4.4).
pub async fn push_branch(worktree_dir: &Path, branch_name: &str) -> Result<()> {
    let args = ["push", "-u", "origin", branch_name];
    if run_git(worktree_dir, &args).await.is_ok() {
        return Ok(());
    }

    warn!(dir = %worktree_dir.display(), branch_name, "push failed, retrying once");
    tokio::time::sleep(Duration::from_secs(2)).await;
    run_git(worktree_dir, &args).await?;
    Ok(())
}

/// The last `n` commits on the current branch, oldest-to-newest omitted
/// (one-line summaries, newest first, as `git log --oneline` emits them).
pub async fn recent_commits(worktree_dir: &Path, n: u32) -> Result<Vec<String>> {
    let out = run_git(
        worktree_dir,
        &["log", "--oneline", "-n", &n.to_string()],
    )
    .await?;

    Ok(out.lines().map(str::to_string).collect())
}

/// Files changed relative to `base`.
pub async fn changed_files(worktree_dir: &Path, base: &str) -> Result<Vec<String>> {
    let out = run_git(worktree_dir, &["diff", "--name-only", base]).await?;
    Ok(out.lines().map(str::to_string).collect())
}

/// Remove every engine worktree and prune stale entries (invoked at
/// orchestrator shutdown) (§4.4 `CleanupWorktrees`).
pub async fn cleanup_worktrees(repo_dir: &Path) -> Result<()> {
    let engines_dir = repo_dir.join(".railyard").join("engines");

    if engines_dir.exists() {
        let mut entries = tokio::fs::read_dir(&engines_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_dir() {
                if let Some(path_str) = path.to_str() {
                    if let Err(e) = run_git(repo_dir, &["worktree", "remove", "--force", path_str]).await {
                        warn!(path = path_str, error = %e, "failed to remove worktree");
                    }
                }
            }
        }
    }

    run_git(repo_dir, &["worktree", "prune"]).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_worktree_dir_is_scoped_under_dot_railyard() {
        let dir = engine_worktree_dir(Path::new("/repo"), "eng-aaaaaaaa");
        assert_eq!(dir, PathBuf::from("/repo/.railyard/engines/eng-aaaaaaaa"));
    }

    #[tokio::test]
    async fn ensure_worktree_creates_a_real_detached_checkout() {
        let origin = tempfile::tempdir().unwrap();
        run_git(origin.path(), &["init", "--quiet"]).await.unwrap();
        run_git(origin.path(), &["commit", "--allow-empty", "-m", "init", "--quiet"])
            .await
            .unwrap();

        let dir = ensure_worktree(origin.path(), "eng-aaaaaaaa").await.unwrap();
        assert!(dir.exists());
        assert!(dir.join(IGNORE_FILE).exists());
    }

    #[tokio::test]
    async fn detect_base_branch_prefers_the_current_symbolic_head() {
        let repo = tempfile::tempdir().unwrap();
        run_git(
            repo.path(),
            &["init", "--quiet", "--initial-branch=develop"],
        )
        .await
        .unwrap();

        let branch = detect_base_branch(repo.path(), Some("main")).await.unwrap();
        assert_eq!(branch, "develop");
    }
}
