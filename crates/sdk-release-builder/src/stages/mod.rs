//! The build stages. Each stage contributes tasks to the plan for the
//! targets it applies to and registers the executor functions for its task
//! kinds. Cross-stage ordering is expressed through `after` dependencies;
//! dependencies on stages a manifest may omit carry the `?` suffix.

pub mod cloud_agent;
pub mod core;
pub mod framework;
pub mod image;
pub mod osdist;

use crate::error::{Error, Result};
use crate::executor::{BuildContext, TaskRegistry};
use crate::manifest::{Manifest, TargetSpec};
use crate::planner::{Plan, Task, TargetRef};

pub trait Stage {
    fn id(&self) -> &'static str;

    /// Add this stage's tasks for the given manifest.
    fn plan(&self, manifest: &Manifest, plan: &mut Plan) -> Result<()>;

    /// Register executor functions for this stage's task kinds.
    fn register(&self, reg: &mut TaskRegistry) -> Result<()>;
}

pub fn builtin_stages() -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(core::CoreStage),
        Box::new(osdist::OsDistStage),
        Box::new(framework::FrameworkStage),
        Box::new(cloud_agent::CloudAgentStage),
        Box::new(image::ImageStage),
    ]
}

pub fn builtin_registry() -> Result<TaskRegistry> {
    let mut reg = TaskRegistry::default();
    for stage in builtin_stages() {
        stage.register(&mut reg)?;
    }
    Ok(reg)
}

/// Build the full release plan: every stage's tasks, then strict target
/// serialization. No task of a later target may start before the final
/// (image) task of the previous target, so shared source trees are only
/// ever used by one target build at a time.
pub fn plan_release(manifest: &Manifest) -> Result<Plan> {
    let mut plan = Plan::default();
    for stage in builtin_stages() {
        stage.plan(manifest, &mut plan)?;
    }

    for pair in manifest.targets.windows(2) {
        let prev_final = format!("{}:{}", image::BUILD_KIND, pair[0].key());
        plan.add_dep_for_target(&TargetRef::from(&pair[1]), &prev_final);
    }

    Ok(plan)
}

/// Look up the manifest target a per-target task belongs to.
pub(crate) fn target_for<'a>(bctx: &'a BuildContext, task: &Task) -> Result<&'a TargetSpec> {
    let Some(target) = task.target.as_ref() else {
        return Err(Error::config(format!(
            "task '{}' carries no target",
            task.id
        )));
    };
    bctx.manifest
        .target(&target.board, &target.module)
        .ok_or_else(|| {
            Error::config(format!(
                "task '{}' names unknown target {}",
                task.id,
                target.key()
            ))
        })
}
