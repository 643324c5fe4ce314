//! Invocations of the external source tools: git, the multi-repository
//! `repo` tool, wget and unzip. Everything here is a thin, checkpoint-free
//! wrapper; callers decide what is skippable.

use std::path::Path;
use std::process::Command;

use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::manifest::{DownloadSpec, OsOverlayRepo};

/// A command with its working directory set. The directory must exist by the
/// time the command is spawned (dry runs never spawn).
pub fn command_in(dir: &Path, program: &str) -> Command {
    let mut cmd = Command::new(program);
    cmd.current_dir(dir);
    cmd
}

/// Clone `repo` at `git_ref` into `dest`, submodules included. `dest` must
/// already exist and be empty.
pub fn fetch_repository(ctx: &ExecCtx, repo: &str, git_ref: &str, dest: &Path) -> Result<()> {
    let mut clone = command_in(dest, "git");
    clone.args(["clone", repo, "."]);
    ctx.run_cmd(clone)
        .map_err(|e| Error::fetch(format!("git clone {repo}: {e}")))?;

    let mut checkout = command_in(dest, "git");
    checkout.args(["checkout", git_ref]);
    ctx.run_cmd(checkout)
        .map_err(|e| Error::fetch(format!("git checkout {git_ref} in {repo}: {e}")))?;

    let mut submodules = command_in(dest, "git");
    submodules.args(["submodule", "update", "--recursive", "--init"]);
    ctx.run_cmd(submodules)
        .map_err(|e| Error::fetch(format!("git submodule update in {repo}: {e}")))
}

/// Initialize and sync a `repo`-managed source tree in `dest` from
/// `manifest_repo`, pinned to `manifest_name` within it.
pub fn sync_manifest_tree(
    ctx: &ExecCtx,
    manifest_repo: &str,
    manifest_name: &str,
    dest: &Path,
) -> Result<()> {
    let mut init = command_in(dest, "repo");
    init.args(["init", "-u", manifest_repo, "-m", manifest_name]);
    ctx.run_cmd(init)
        .map_err(|e| Error::fetch(format!("repo init -m {manifest_name}: {e}")))?;

    let mut sync = command_in(dest, "repo");
    sync.arg("sync");
    ctx.run_cmd(sync)
        .map_err(|e| Error::fetch(format!("repo sync of {manifest_repo}: {e}")))
}

/// Clone one overlay repository into its directory inside an OS source tree.
pub fn fetch_overlay(ctx: &ExecCtx, tree: &Path, overlay: &OsOverlayRepo) -> Result<()> {
    let dest = tree.join(&overlay.dir);
    if !ctx.dry_run {
        std::fs::create_dir_all(&dest)
            .map_err(|e| Error::fetch(format!("failed to create {}: {e}", dest.display())))?;
    }
    fetch_repository(ctx, &overlay.url, &overlay.git_ref, &dest)
}

/// Download one auxiliary file into `tree/<spec.dir>` and optionally unpack
/// it there. The only supported unpack method is "unzip".
pub fn download_into(ctx: &ExecCtx, tree: &Path, spec: &DownloadSpec) -> Result<()> {
    match spec.unpack.as_deref() {
        None | Some("unzip") => {}
        Some(other) => {
            return Err(Error::config(format!(
                "unsupported unpack method '{other}' for {}",
                spec.url
            )));
        }
    }

    let dest = tree.join(&spec.dir);
    if !ctx.dry_run {
        std::fs::create_dir_all(&dest)
            .map_err(|e| Error::fetch(format!("failed to create {}: {e}", dest.display())))?;
    }

    let mut wget = command_in(&dest, "wget");
    wget.arg(&spec.url);
    ctx.run_cmd(wget)
        .map_err(|e| Error::fetch(format!("wget {}: {e}", spec.url)))?;

    if spec.unpack.as_deref() == Some("unzip") {
        let mut unzip = command_in(&dest, "unzip");
        unzip.args(["-o", spec.file_name()]);
        ctx.run_cmd(unzip)
            .map_err(|e| Error::fetch(format!("unzip {}: {e}", spec.file_name())))?;
    }
    Ok(())
}

/// Restore every git checkout under `tree` to pristine state, deleting
/// ignored and untracked files but keeping `keep_marker` at each checkout
/// root. Used between per-target builds of a shared source tree.
pub fn force_clean_nested_repos(ctx: &ExecCtx, tree: &Path, keep_marker: &str) -> Result<()> {
    if !tree.exists() {
        return Ok(());
    }
    let exclude = format!("/{keep_marker}");
    for entry in WalkDir::new(tree).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_dir() || !entry.path().join(".git").exists() {
            continue;
        }
        let mut clean = command_in(entry.path(), "git");
        clean.args(["clean", "-xfd", "-e", &exclude]);
        ctx.run_cmd(clean).map_err(|e| {
            Error::command(format!(
                "git clean in {} failed: {e}",
                entry.path().display()
            ))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MemorySink;
    use std::sync::Arc;

    fn dry_ctx() -> (ExecCtx, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        let mut ctx = ExecCtx::new(true, sink.clone());
        ctx.set_task("test");
        (ctx, sink)
    }

    #[test]
    fn fetch_repository_clones_checks_out_and_inits_submodules() {
        let (ctx, sink) = dry_ctx();
        fetch_repository(
            &ctx,
            "https://example.com/bsp.git",
            "v1.2",
            Path::new("/tmp/x"),
        )
        .expect("dry run");
        let lines = sink.log_lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("clone"));
        assert!(lines[1].contains("checkout") && lines[1].contains("v1.2"));
        assert!(lines[2].contains("submodule"));
    }

    #[test]
    fn unsupported_unpack_method_is_rejected_up_front() {
        let (ctx, sink) = dry_ctx();
        let spec = DownloadSpec {
            url: "https://example.com/blob.tar.xz".into(),
            dir: "downloads".into(),
            unpack: Some("tar".into()),
        };
        let err = download_into(&ctx, Path::new("/tmp/x"), &spec).expect_err("must fail");
        assert!(err.to_string().contains("unsupported unpack method"));
        assert!(sink.log_lines().is_empty(), "nothing should run");
    }

    #[test]
    fn download_with_unzip_runs_both_tools() {
        let (ctx, sink) = dry_ctx();
        let spec = DownloadSpec {
            url: "https://example.com/firmware.zip".into(),
            dir: "downloads".into(),
            unpack: Some("unzip".into()),
        };
        download_into(&ctx, Path::new("/tmp/x"), &spec).expect("dry run");
        let lines = sink.log_lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("wget"));
        assert!(lines[1].contains("unzip") && lines[1].contains("firmware.zip"));
    }

    #[test]
    fn force_clean_walks_only_git_checkouts() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let repo_a = tmp.path().join("a");
        let plain = tmp.path().join("plain");
        std::fs::create_dir_all(repo_a.join(".git")).unwrap();
        std::fs::create_dir_all(&plain).unwrap();

        let (ctx, sink) = dry_ctx();
        force_clean_nested_repos(&ctx, tmp.path(), ".fetched").expect("dry run");
        let lines = sink.log_lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("clean") && lines[0].contains("/.fetched"));
    }
}
