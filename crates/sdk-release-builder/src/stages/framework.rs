//! Application framework stage: one shared fetch of the manifest-driven
//! source tree, then one build per target inside a profile of that target's
//! dependencies. The framework's own version comes from the `version` file
//! at the tree root and is resolved exactly once, at fetch time.

use std::fs;
use std::path::Path;

use walkdir::WalkDir;

use super::{Stage, core, osdist, target_for};
use crate::checkpoint::fetch_once;
use crate::error::{Error, Result};
use crate::executor::{BuildContext, ExecCtx, TaskRegistry};
use crate::manifest::Manifest;
use crate::planner::{Plan, Task, TargetRef};
use crate::profile::{Profile, with_profile};
use crate::runner::{command_in, sync_manifest_tree};
use crate::store::{PackageId, PackageInfo, PackageManifest, Role, Store, write_package_manifest};

pub const FETCH_KIND: &str = "framework.fetch";
pub const BUILD_KIND: &str = "framework.build";

pub struct FrameworkStage;

impl Stage for FrameworkStage {
    fn id(&self) -> &'static str {
        "framework"
    }

    fn plan(&self, manifest: &Manifest, plan: &mut Plan) -> Result<()> {
        if manifest.framework.is_none() {
            return Ok(());
        }
        plan.add(Task {
            id: FETCH_KIND.to_string(),
            label: "fetch framework source tree".to_string(),
            stage: "framework".to_string(),
            phase: "fetch".to_string(),
            kind: FETCH_KIND,
            target: None,
            after: vec![core::INIT_KIND.to_string()],
        })?;
        for target in &manifest.targets {
            plan.add(Task {
                id: format!("{BUILD_KIND}:{}", target.key()),
                label: format!("framework build for {}", target.key()),
                stage: "framework".to_string(),
                phase: "build".to_string(),
                kind: BUILD_KIND,
                target: Some(TargetRef::from(target)),
                after: vec![
                    FETCH_KIND.to_string(),
                    // The toolchain package must exist first for OS-overlay
                    // targets; plain targets have no such task.
                    format!("{}:{}?", osdist::BUILD_KIND, target.key()),
                ],
            })?;
        }
        Ok(())
    }

    fn register(&self, reg: &mut TaskRegistry) -> Result<()> {
        reg.add(FETCH_KIND, exec_fetch)?;
        reg.add(BUILD_KIND, exec_build)
    }
}

fn exec_fetch(bctx: &BuildContext, _task: &Task, ctx: &ExecCtx) -> Result<()> {
    let src = bctx
        .manifest
        .framework
        .as_ref()
        .ok_or_else(|| Error::config("no framework source configured"))?;

    let dir = bctx.ws.framework_fetch_dir();
    fetch_once(&dir, || {
        sync_manifest_tree(ctx, &src.manifest_repo, &src.base_manifest, &dir)
    })?;

    let root = bctx.ws.framework_root(src);
    let version = read_version_file(&root.join("version"))?;
    ctx.log(&format!("framework version {version}"));
    ctx.set_framework_version(version);
    Ok(())
}

fn exec_build(bctx: &BuildContext, task: &Task, ctx: &ExecCtx) -> Result<()> {
    let target = target_for(bctx, task)?;
    let src = bctx
        .manifest
        .framework
        .as_ref()
        .ok_or_else(|| Error::config("no framework source configured"))?;
    let version = ctx
        .framework_version()
        .ok_or_else(|| Error::command("framework version was never resolved"))?;

    let id = PackageId::new(Role::Framework, &target.board, &target.module, &version);
    let store = Store::new(&bctx.ws);
    store.remove(ctx, &id)?;

    let root = bctx.ws.framework_root(src);
    let mut clean = command_in(&root, "make");
    clean.arg("clean");
    ctx.run_cmd(clean)?;

    let depends = bctx.manifest.build_depends(target);
    with_profile(ctx, &bctx.ws, &depends, |ctx| {
        Profile::run_in(ctx, &root, &format!("make {}", target.module))
    })?;

    let staged = store.stage(&id.to_string())?;
    copy_tree_without_git(&root, &staged)?;
    write_package_manifest(
        &staged,
        &PackageManifest {
            info: PackageInfo {
                name: id.name(),
                version: version.clone(),
                description: Some(format!(
                    "Application framework {version} for {} {}",
                    target.board, target.module
                )),
                master: false,
                depends: vec![],
                requires: vec![],
            },
        },
    )?;
    store.publish(ctx, &id, &staged)
}

fn read_version_file(path: &Path) -> Result<String> {
    let data = fs::read_to_string(path).map_err(|e| {
        Error::fetch(format!(
            "framework tree has no readable version file at {}: {e}",
            path.display()
        ))
    })?;
    let version = data.lines().next().unwrap_or("").trim().to_string();
    if version.is_empty() {
        return Err(Error::fetch(format!(
            "framework version file {} is empty",
            path.display()
        )));
    }
    Ok(version)
}

/// Copy a built source tree into a staging directory, leaving the git
/// metadata behind.
fn copy_tree_without_git(from: &Path, to: &Path) -> Result<()> {
    for entry in WalkDir::new(from) {
        let entry = entry.map_err(|e| Error::packaging(format!("walk of {}: {e}", from.display())))?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| Error::packaging(e.to_string()))?;
        if rel.as_os_str().is_empty() || rel.components().any(|c| c.as_os_str() == ".git") {
            continue;
        }
        let dest = to.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)
                .map_err(|e| Error::packaging(format!("failed to create {}: {e}", dest.display())))?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    Error::packaging(format!("failed to create {}: {e}", parent.display()))
                })?;
            }
            fs::copy(entry.path(), &dest).map_err(|e| {
                Error::packaging(format!("failed to copy {}: {e}", entry.path().display()))
            })?;
        }
    }
    Ok(())
}
