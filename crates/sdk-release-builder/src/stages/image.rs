//! Final per-target stage: build the factory images from the board support
//! tree and publish the master package that ties the whole release together.
//! Also owns the shared board-support fetch, since no other stage touches
//! that tree.
//!
//! Two image variants are produced when a cloud agent is configured: one
//! with the agent baked in and one without. The modem firmware baked into
//! both comes from the modem-image package installed into the build profile.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value as JsonValue;

use super::{Stage, cloud_agent, core, framework, target_for};
use crate::checkpoint::fetch_once;
use crate::error::{Error, Result};
use crate::executor::{BuildContext, ExecCtx, TaskRegistry};
use crate::manifest::{Manifest, TargetSpec};
use crate::planner::{Plan, Task, TargetRef};
use crate::profile::{Profile, with_profile};
use crate::runner::{command_in, download_into, fetch_repository};
use crate::store::{PackageId, Role, Store};
use crate::workspace::Workspace;

pub const FETCH_KIND: &str = "bsp.fetch";
pub const BUILD_KIND: &str = "image.build";

pub struct ImageStage;

impl Stage for ImageStage {
    fn id(&self) -> &'static str {
        "image"
    }

    fn plan(&self, manifest: &Manifest, plan: &mut Plan) -> Result<()> {
        plan.add(Task {
            id: FETCH_KIND.to_string(),
            label: "fetch board support tree".to_string(),
            stage: "image".to_string(),
            phase: "fetch".to_string(),
            kind: FETCH_KIND,
            target: None,
            after: vec![core::INIT_KIND.to_string()],
        })?;
        for target in &manifest.targets {
            plan.add(Task {
                id: format!("{BUILD_KIND}:{}", target.key()),
                label: format!("factory images and master package for {}", target.key()),
                stage: "image".to_string(),
                phase: "build".to_string(),
                kind: BUILD_KIND,
                target: Some(TargetRef::from(target)),
                after: vec![
                    FETCH_KIND.to_string(),
                    format!("{}:{}?", framework::BUILD_KIND, target.key()),
                    format!("{}:{}?", cloud_agent::BUILD_KIND, target.key()),
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
    let bsp = &bctx.manifest.bsp;
    let dir = bctx.ws.bsp_dir();
    fetch_once(&dir, || {
        fetch_repository(ctx, &bsp.repo, &bsp.git_ref, &dir)?;
        for download in &bsp.downloads {
            download_into(ctx, &dir, download)?;
        }
        Ok(())
    })
}

/// Modem firmware resolved from the profile data of an active profile.
#[derive(Debug, Clone)]
pub struct ModemFirmware {
    pub path: PathBuf,
    pub version: String,
}

/// Locate the target's modem firmware file inside the installed
/// `<family>-modem-image` package and read its version from the package's
/// `manifest.json`. Only valid while a profile holding that package is
/// active.
pub fn resolve_modem_firmware(ws: &Workspace, target: &TargetSpec) -> Result<ModemFirmware> {
    let package_name = format!("{}-modem-image", target.abbreviated_module());
    let package_dir = ws.installed_package_dir(&package_name);

    let path = package_dir.join(&target.modem_firmware);
    if !path.exists() {
        return Err(Error::command(format!(
            "modem firmware {} not found in installed package {package_name}",
            target.modem_firmware
        )));
    }

    let manifest_path = package_dir.join("manifest.json");
    let data = fs::read_to_string(&manifest_path).map_err(|e| {
        Error::command(format!(
            "cannot read {}: {e}",
            manifest_path.display()
        ))
    })?;
    let parsed: JsonValue = serde_json::from_str(&data)
        .map_err(|e| Error::command(format!("malformed {}: {e}", manifest_path.display())))?;
    let version = parsed
        .get("info")
        .and_then(|i| i.get("version"))
        .and_then(JsonValue::as_str)
        .ok_or_else(|| {
            Error::command(format!(
                "{} carries no info.version",
                manifest_path.display()
            ))
        })?
        .to_string();

    Ok(ModemFirmware { path, version })
}

/// Dependency list recorded on the master package: everything the target
/// build consumed, including the framework and cloud-agent packages
/// produced earlier in this run.
pub fn master_depends(
    manifest: &Manifest,
    target: &TargetSpec,
    framework_version: Option<&str>,
    cloud_version: Option<&str>,
) -> Vec<String> {
    let mut out = manifest.build_depends(target);
    if let Some(v) = framework_version {
        out.push(PackageId::new(Role::Framework, &target.board, &target.module, v).to_string());
    }
    if let Some(v) = cloud_version {
        out.push(PackageId::new(Role::CloudAgent, &target.board, &target.module, v).to_string());
    }
    out
}

fn exec_build(bctx: &BuildContext, task: &Task, ctx: &ExecCtx) -> Result<()> {
    let target = target_for(bctx, task)?;
    let manifest = &bctx.manifest;
    let version = &manifest.release.version;

    let framework_version = ctx.framework_version();
    if manifest.framework.is_some() && framework_version.is_none() {
        return Err(Error::command("framework version was never resolved"));
    }
    let cloud_version = manifest.cloud_agent.as_ref().map(|c| c.version.clone());

    let depends = master_depends(
        manifest,
        target,
        framework_version.as_deref(),
        cloud_version.as_deref(),
    );

    let bsp_dir = bctx.ws.bsp_dir();
    let spk_output = bsp_dir
        .join("build")
        .join(format!("{}_{}.spk", target.board, target.module));

    let mut firmware: Option<ModemFirmware> = None;
    with_profile(ctx, &bctx.ws, &depends, |ctx| {
        let fw = resolve_modem_firmware(&bctx.ws, target)?;
        let make_target = format!(
            "make {}_spk MODULE={} MODEM_FIRMWARE={}",
            target.board,
            target.module,
            fw.path.display()
        );

        if cloud_version.is_some() {
            Profile::run_in(ctx, &bsp_dir, &make_target)?;
            copy_image(
                &spk_output,
                &bctx.ws,
                &format!("{}_{version}-cloud.spk", target.key()),
            )?;
            Profile::run_in(ctx, &bsp_dir, "make clean")?;
        }

        Profile::run_in(ctx, &bsp_dir, &format!("{make_target} CLOUD_AGENT=0"))?;
        copy_image(&spk_output, &bctx.ws, &format!("{}_{version}.spk", target.key()))?;

        firmware = Some(fw);
        Ok(())
    })?;
    let firmware = firmware.ok_or_else(|| Error::command("modem firmware was never resolved"))?;

    package_master(
        bctx,
        ctx,
        target,
        &depends,
        framework_version.as_deref(),
        cloud_version.as_deref(),
        &firmware,
    )
}

fn copy_image(from: &Path, ws: &Workspace, file_name: &str) -> Result<()> {
    if !from.exists() {
        return Err(Error::command(format!(
            "image build produced no artifact at {}",
            from.display()
        )));
    }
    let to = ws.output_image_path(file_name);
    fs::copy(from, &to)
        .map_err(|e| Error::command(format!("failed to copy image to {}: {e}", to.display())))?;
    Ok(())
}

fn package_master(
    bctx: &BuildContext,
    ctx: &ExecCtx,
    target: &TargetSpec,
    depends: &[String],
    framework_version: Option<&str>,
    cloud_version: Option<&str>,
    firmware: &ModemFirmware,
) -> Result<()> {
    let manifest = &bctx.manifest;
    let version = &manifest.release.version;
    let id = PackageId::new(Role::Master, &target.board, &target.module, version);

    let mut components = vec![format!("modem firmware {}", firmware.version)];
    if let Some(v) = framework_version {
        components.push(format!("framework {v}"));
    }
    if let Some(v) = cloud_version {
        components.push(format!("cloud agent {v}"));
    }
    let description = format!(
        "{} {} software release {version} ({})",
        target.board,
        target.module,
        components.join(", ")
    );

    let store = Store::new(&bctx.ws);
    let staged = store.stage(&id.to_string())?;

    let mut gen_manifest = command_in(&staged, "leaf");
    gen_manifest.args(["build", "manifest", "-o", "."]);
    gen_manifest.args(["--name", &id.name()]);
    gen_manifest.args(["--version", version]);
    gen_manifest.args(["--description", &description]);
    gen_manifest.args(["--master", "true"]);
    gen_manifest.args(["--tag", &target.board]);
    gen_manifest.args(["--tag", &target.module]);
    for dep in depends {
        gen_manifest.args(["--depends", dep]);
    }
    for req in manifest.requires_for(target) {
        gen_manifest.args(["--requires", &req]);
    }
    ctx.run_cmd(gen_manifest)
        .map_err(|e| Error::packaging(format!("leaf build manifest for {id}: {e}")))?;

    store.publish(ctx, &id, &staged)
}
