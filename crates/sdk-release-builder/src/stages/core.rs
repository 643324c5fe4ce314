//! Workspace and store initialization. Runs first; every fetch task is
//! ordered after it.

use super::Stage;
use crate::error::Result;
use crate::executor::{BuildContext, ExecCtx, TaskRegistry};
use crate::manifest::Manifest;
use crate::planner::{Plan, Task};
use crate::store::Store;

pub const INIT_KIND: &str = "store.init";

pub struct CoreStage;

impl Stage for CoreStage {
    fn id(&self) -> &'static str {
        "core"
    }

    fn plan(&self, _manifest: &Manifest, plan: &mut Plan) -> Result<()> {
        plan.add(Task {
            id: INIT_KIND.to_string(),
            label: "initialize workspace and package store".to_string(),
            stage: "core".to_string(),
            phase: "init".to_string(),
            kind: INIT_KIND,
            target: None,
            after: vec![],
        })
    }

    fn register(&self, reg: &mut TaskRegistry) -> Result<()> {
        reg.add(INIT_KIND, exec_init)
    }
}

fn exec_init(bctx: &BuildContext, _task: &Task, ctx: &ExecCtx) -> Result<()> {
    bctx.ws.prepare()?;
    let store = Store::new(&bctx.ws);
    // The remote must have an index before it can be registered; an empty
    // one is fine until the first publish.
    store.rebuild_index(ctx)?;
    store.register_remote(ctx)
}
