//! Build-profile lifecycle. A profile installs a set of packages from the
//! store and exposes their toolchains to commands run inside a profile
//! shell. Only one profile ever exists at a time; it is created for one
//! task's build and deleted again afterwards, success or failure.
//!
//! Every lifecycle command runs with the build root as working directory:
//! the package manager treats that directory as its workspace and writes
//! the active profile's data under `leaf-data/` inside it, keeping all
//! state within the sandboxed build root.

use std::path::Path;

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::runner::command_in;
use crate::store::strip_latest;
use crate::workspace::Workspace;

/// The single, fixed profile name. Reusing one name keeps the package
/// manager's state small and makes a leftover profile from a crashed run
/// self-healing: the next setup replaces it.
pub const PROFILE_NAME: &str = "profile";

pub struct Profile;

impl Profile {
    /// Run a shell command inside the active profile, from `dir`, so the
    /// installed toolchains are on PATH and profile variables are set.
    pub fn run_in(ctx: &ExecCtx, dir: &Path, script: &str) -> Result<()> {
        let mut cmd = command_in(dir, "leaf");
        cmd.args(["shell", "-c", script]);
        cmd.env("LEAF_NON_INTERACTIVE", "1");
        ctx.run_cmd(cmd)
            .map_err(|e| Error::profile(format!("profile shell command failed: {e}")))
    }

    fn setup(ctx: &ExecCtx, root: &Path, depends: &[String]) -> Result<()> {
        let mut refresh = command_in(root, "leaf");
        refresh.args(["remote", "fetch"]);
        refresh.env("LEAF_NON_INTERACTIVE", "1");
        ctx.run_cmd(refresh)
            .map_err(|e| Error::profile(format!("leaf remote fetch failed: {e}")))?;

        let mut setup = command_in(root, "leaf");
        setup.arg("setup");
        for dep in depends {
            // Floating "_latest" dependencies are passed as bare names so the
            // resolver picks the newest version the remote serves.
            setup.args(["-p", strip_latest(dep)]);
        }
        setup.arg(PROFILE_NAME);
        setup.env("LEAF_NON_INTERACTIVE", "1");
        ctx.run_cmd(setup)
            .map_err(|e| Error::profile(format!("leaf setup of [{}] failed: {e}", depends.join(", "))))
    }

    fn delete(ctx: &ExecCtx, root: &Path) -> Result<()> {
        let mut delete = command_in(root, "leaf");
        delete.args(["profile", "delete", PROFILE_NAME]);
        delete.env("LEAF_NON_INTERACTIVE", "1");
        ctx.run_cmd(delete)
            .map_err(|e| Error::profile(format!("leaf profile delete failed: {e}")))
    }
}

/// Set up a profile with `depends` installed, run `body` inside it, and
/// delete the profile again no matter how `body` ends. A body error wins
/// over a teardown error; the teardown error is still logged.
pub fn with_profile(
    ctx: &ExecCtx,
    ws: &Workspace,
    depends: &[String],
    body: impl FnOnce(&ExecCtx) -> Result<()>,
) -> Result<()> {
    Profile::setup(ctx, &ws.root, depends)?;
    let result = body(ctx);
    match Profile::delete(ctx, &ws.root) {
        Ok(()) => result,
        Err(teardown) => {
            if result.is_ok() {
                Err(teardown)
            } else {
                ctx.log(&format!("profile teardown also failed: {teardown}"));
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MemorySink;
    use std::sync::Arc;

    fn dry_ctx() -> (ExecCtx, Arc<MemorySink>, Workspace) {
        let sink = Arc::new(MemorySink::default());
        let mut ctx = ExecCtx::new(true, sink.clone());
        ctx.set_task("test");
        (ctx, sink, Workspace::at("/tmp/rb/build"))
    }

    #[test]
    fn profile_is_deleted_after_the_body_runs() {
        let (ctx, sink, ws) = dry_ctx();
        with_profile(&ctx, &ws, &["framework-red-wp85_1.0.0".into()], |ctx| {
            ctx.log("building");
            Ok(())
        })
        .expect("dry run");

        let lines = sink.log_lines();
        let setup = lines.iter().position(|l| l.contains("setup")).unwrap();
        let body = lines.iter().position(|l| l == "building").unwrap();
        let delete = lines
            .iter()
            .position(|l| l.contains("profile") && l.contains("delete"))
            .unwrap();
        assert!(setup < body && body < delete);
    }

    #[test]
    fn body_failure_still_tears_down_and_wins() {
        let (ctx, sink, ws) = dry_ctx();
        let err = with_profile(&ctx, &ws, &[], |_| Err(Error::command("build exploded")))
            .expect_err("body error must propagate");
        assert!(err.to_string().contains("build exploded"));
        assert!(
            sink.log_lines()
                .iter()
                .any(|l| l.contains("profile") && l.contains("delete")),
            "teardown must run on failure"
        );
    }

    #[test]
    fn floating_versions_are_requested_by_bare_name() {
        let (ctx, sink, ws) = dry_ctx();
        with_profile(&ctx, &ws, &["swi-vscode-support_latest".into()], |_| Ok(()))
            .expect("dry run");
        let lines = sink.log_lines();
        let setup = lines.iter().find(|l| l.contains("setup")).unwrap();
        assert!(setup.contains("swi-vscode-support"));
        assert!(!setup.contains("swi-vscode-support_latest"));
    }
}
