//! Custom OS distribution builds. Only targets carrying an `os` overlay get
//! a task here; the result is a toolchain package and a linux image package
//! in the store, guarded by a `.built` checkpoint so re-runs skip the most
//! expensive stage of the pipeline entirely.

use std::fs;
use std::path::{Path, PathBuf};

use super::{Stage, core, target_for};
use crate::checkpoint::{Checkpoint, fetch_once};
use crate::error::{Error, Result};
use crate::executor::{BuildContext, ExecCtx, TaskRegistry};
use crate::manifest::{Manifest, TargetSpec};
use crate::planner::{Plan, Task, TargetRef};
use crate::runner::{command_in, fetch_overlay, sync_manifest_tree};
use crate::store::{PackageId, PackageInfo, PackageManifest, Role, Store, write_package_manifest};

pub const BUILD_KIND: &str = "osdist.build";

pub struct OsDistStage;

impl Stage for OsDistStage {
    fn id(&self) -> &'static str {
        "osdist"
    }

    fn plan(&self, manifest: &Manifest, plan: &mut Plan) -> Result<()> {
        for target in manifest.targets.iter().filter(|t| t.os.is_some()) {
            plan.add(Task {
                id: format!("{BUILD_KIND}:{}", target.key()),
                label: format!("OS distribution for {}", target.key()),
                stage: "osdist".to_string(),
                phase: "build".to_string(),
                kind: BUILD_KIND,
                target: Some(TargetRef::from(target)),
                after: vec![core::INIT_KIND.to_string()],
            })?;
        }
        Ok(())
    }

    fn register(&self, reg: &mut TaskRegistry) -> Result<()> {
        reg.add(BUILD_KIND, exec_build)
    }
}

fn exec_build(bctx: &BuildContext, task: &Task, ctx: &ExecCtx) -> Result<()> {
    let target = target_for(bctx, task)?;
    let os = target.os.as_ref().ok_or_else(|| {
        Error::config(format!("target {} has no OS build overlay", target.key()))
    })?;

    let dir = bctx.ws.os_build_dir(target);
    let built = Checkpoint::built(&dir);
    if built.is_done() {
        ctx.log(&format!(
            "OS distribution for {} already built, skipping",
            target.key()
        ));
        return Ok(());
    }

    fetch_once(&dir, || {
        sync_manifest_tree(ctx, &os.manifest_repo, &os.base_manifest, &dir)?;
        for overlay in &os.add {
            fetch_overlay(ctx, &dir, overlay)?;
        }
        Ok(())
    })?;

    let mut image = command_in(&dir, "make");
    image.arg("image_bin");
    ctx.run_cmd(image)?;

    let mut toolchain = command_in(&dir, "make");
    toolchain.arg("toolchain_bin");
    ctx.run_cmd(toolchain)?;

    let store = Store::new(&bctx.ws);
    package_toolchain(&store, ctx, bctx, target, &dir)?;
    package_linux_image(&store, ctx, bctx, target, &dir)?;

    built.mark()
}

fn package_toolchain(
    store: &Store,
    ctx: &ExecCtx,
    bctx: &BuildContext,
    target: &TargetSpec,
    dir: &Path,
) -> Result<()> {
    let id = PackageId::new(
        Role::Toolchain,
        &target.board,
        &target.module,
        &bctx.manifest.release.version,
    );
    let installer = find_toolchain_installer(&dir.join("build_bin/tmp/deploy/sdk"))?;

    let staged = store.stage(&id.to_string())?;
    let installer_name = installer
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::packaging("toolchain installer has no file name".to_string()))?;
    fs::copy(&installer, staged.join(&installer_name)).map_err(|e| {
        Error::packaging(format!("failed to stage {}: {e}", installer.display()))
    })?;
    write_package_manifest(
        &staged,
        &PackageManifest {
            info: PackageInfo {
                name: id.name(),
                version: id.version.clone(),
                description: Some(format!(
                    "Cross toolchain for {} {}",
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

fn package_linux_image(
    store: &Store,
    ctx: &ExecCtx,
    bctx: &BuildContext,
    target: &TargetSpec,
    dir: &Path,
) -> Result<()> {
    let id = PackageId::new(
        Role::LinuxImage,
        &target.board,
        &target.module,
        &bctx.manifest.release.version,
    );
    let image = dir
        .join("build_bin/tmp/deploy/images")
        .join(format!("os_{}.cwe", target.module));
    if !image.exists() {
        return Err(Error::packaging(format!(
            "OS build produced no image at {}",
            image.display()
        )));
    }

    let staged = store.stage(&id.to_string())?;
    fs::copy(&image, staged.join("linux.cwe"))
        .map_err(|e| Error::packaging(format!("failed to stage {}: {e}", image.display())))?;
    write_package_manifest(
        &staged,
        &PackageManifest {
            info: PackageInfo {
                name: id.name(),
                version: id.version.clone(),
                description: Some(format!(
                    "Linux image for {} {}",
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

/// The deploy directory holds exactly one self-extracting toolchain
/// installer; anything else means the OS build changed shape under us.
fn find_toolchain_installer(sdk_dir: &Path) -> Result<PathBuf> {
    let entries = fs::read_dir(sdk_dir).map_err(|e| {
        Error::packaging(format!("failed to read {}: {e}", sdk_dir.display()))
    })?;
    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::packaging(e.to_string()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.contains("-toolchain-") && name.ends_with(".sh") {
            found.push(entry.path());
        }
    }
    match found.len() {
        1 => Ok(found.remove(0)),
        0 => Err(Error::packaging(format!(
            "no toolchain installer under {}",
            sdk_dir.display()
        ))),
        n => Err(Error::packaging(format!(
            "{n} toolchain installers under {}, expected exactly one",
            sdk_dir.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_installer_is_required() {
        let tmp = tempfile::tempdir().expect("tempdir");
        assert!(find_toolchain_installer(tmp.path()).is_err());

        fs::write(tmp.path().join("os-toolchain-x86_64.sh"), b"x").unwrap();
        fs::write(tmp.path().join("README"), b"x").unwrap();
        let found = find_toolchain_installer(tmp.path()).expect("single installer");
        assert!(found.ends_with("os-toolchain-x86_64.sh"));

        fs::write(tmp.path().join("other-toolchain-arm.sh"), b"x").unwrap();
        let err = find_toolchain_installer(tmp.path()).expect_err("ambiguous");
        assert!(err.to_string().contains("expected exactly one"));
    }
}
