//! Cloud-agent stage: one shared clone, then one build per target. The
//! shared tree is reused across targets, so each build starts by restoring
//! every nested git checkout to pristine state (keeping the fetch marker).
//! The agent's own build system produces a finished `.leaf` archive, which
//! is published as-is.

use super::{Stage, core, framework, target_for};
use crate::checkpoint::{FETCHED_MARKER, fetch_once};
use crate::error::{Error, Result};
use crate::executor::{BuildContext, ExecCtx, TaskRegistry};
use crate::manifest::Manifest;
use crate::planner::{Plan, Task, TargetRef};
use crate::profile::{Profile, with_profile};
use crate::runner::{fetch_repository, force_clean_nested_repos};
use crate::store::{PackageId, Role, Store};

pub const FETCH_KIND: &str = "cloud.fetch";
pub const BUILD_KIND: &str = "cloud.build";

pub struct CloudAgentStage;

impl Stage for CloudAgentStage {
    fn id(&self) -> &'static str {
        "cloud-agent"
    }

    fn plan(&self, manifest: &Manifest, plan: &mut Plan) -> Result<()> {
        if manifest.cloud_agent.is_none() {
            return Ok(());
        }
        plan.add(Task {
            id: FETCH_KIND.to_string(),
            label: "fetch cloud agent source".to_string(),
            stage: "cloud-agent".to_string(),
            phase: "fetch".to_string(),
            kind: FETCH_KIND,
            target: None,
            after: vec![core::INIT_KIND.to_string()],
        })?;
        for target in &manifest.targets {
            plan.add(Task {
                id: format!("{BUILD_KIND}:{}", target.key()),
                label: format!("cloud agent build for {}", target.key()),
                stage: "cloud-agent".to_string(),
                phase: "build".to_string(),
                kind: BUILD_KIND,
                target: Some(TargetRef::from(target)),
                after: vec![
                    FETCH_KIND.to_string(),
                    format!("{}:{}?", framework::BUILD_KIND, target.key()),
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
        .cloud_agent
        .as_ref()
        .ok_or_else(|| Error::config("no cloud agent source configured"))?;
    let dir = bctx.ws.cloud_agent_dir();
    fetch_once(&dir, || fetch_repository(ctx, &src.repo, &src.git_ref, &dir))
}

fn exec_build(bctx: &BuildContext, task: &Task, ctx: &ExecCtx) -> Result<()> {
    let target = target_for(bctx, task)?;
    let src = bctx
        .manifest
        .cloud_agent
        .as_ref()
        .ok_or_else(|| Error::config("no cloud agent source configured"))?;

    let id = PackageId::new(Role::CloudAgent, &target.board, &target.module, &src.version);
    let store = Store::new(&bctx.ws);
    store.remove(ctx, &id)?;

    let dir = bctx.ws.cloud_agent_dir();
    force_clean_nested_repos(ctx, &dir, FETCHED_MARKER)?;

    let mut depends = bctx.manifest.build_depends(target);
    if let Some(fw_version) = ctx.framework_version() {
        depends.push(
            PackageId::new(Role::Framework, &target.board, &target.module, fw_version).to_string(),
        );
    }

    with_profile(ctx, &bctx.ws, &depends, |ctx| {
        Profile::run_in(
            ctx,
            &dir,
            &format!("make {} VERSION={}", target.module, src.version),
        )
    })?;

    let artifact_dir = dir.join("build").join(&target.module);
    store.publish_prebuilt(ctx, &artifact_dir)
}
