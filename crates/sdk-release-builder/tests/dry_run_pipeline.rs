//! End-to-end dry run of the full pipeline over a throwaway workspace:
//! every planned task is visited and reported, nothing is executed, and
//! the workspace is left untouched.

use std::sync::Arc;

use sdk_release_builder::config;
use sdk_release_builder::executor::{
    BuildContext, ExecCtx, ExecEvent, MemorySink, execute_plan,
};
use sdk_release_builder::manifest::Manifest;
use sdk_release_builder::stages::{builtin_registry, plan_release};
use sdk_release_builder::workspace::Workspace;

const MANIFEST: &str = r#"
[release]
version = "2.0.0"
requires = ["swi-license_1.2"]
depends = ["swi-vscode-support_latest"]

[sources.bsp]
repo = "https://example.com/bsp.git"
ref = "abc123"

[[sources.bsp.downloads]]
url = "https://example.com/blobs/radio.zip"
dir = "components/radio"
unpack = "unzip"

[sources.framework]
manifest_repo = "https://example.com/manifest.git"
base_manifest = "releases/fw.xml"

[sources.cloud_agent]
repo = "https://example.com/cloud.git"
ref = "main"
version = "3.0.0"

[boards.red.wp85]
depends = ["wp85-toolchain_1", "wp85-linux-image_1"]
modem_firmware = "fw-wp85.spk"

[boards.yellow.wp76xx]
depends = ["wp76-modem-image_13.3"]
modem_firmware = "fw-wp76.spk"

[boards.yellow.wp76xx.os]
manifest_repo = "https://example.com/os-manifest.git"
base_manifest = "tags/os.xml"

[[boards.yellow.wp76xx.os.add]]
url = "https://example.com/meta.git"
ref = "main"
dir = "meta-overlay"
"#;

#[test]
fn dry_run_visits_every_task_and_mutates_nothing() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let manifest_path = tmp.path().join("release.toml");
    std::fs::write(&manifest_path, MANIFEST).unwrap();

    let doc = config::load(&manifest_path).expect("load");
    let manifest = Manifest::from_doc(&doc).expect("validate");
    let plan = plan_release(&manifest).expect("plan");
    let registry = builtin_registry().expect("registry");

    let ws = Workspace::at(tmp.path().join("build"));
    let bctx = BuildContext {
        manifest,
        ws: ws.clone(),
    };
    let sink = Arc::new(MemorySink::default());
    let mut ctx = ExecCtx::new(true, sink.clone()).with_env(ws.store_env());

    execute_plan(&bctx, &plan, &registry, &mut ctx).expect("dry run succeeds");

    let events = sink.events();
    let started: Vec<String> = events
        .iter()
        .filter_map(|ev| match ev {
            ExecEvent::TaskStarted { id } => Some(id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(started.len(), plan.len(), "every task is visited");
    assert_eq!(started[0], "store.init");

    let finished_ok = events
        .iter()
        .filter(|ev| matches!(ev, ExecEvent::TaskFinished { ok: true, .. }))
        .count();
    assert_eq!(finished_ok, plan.len());
    assert!(events.iter().any(|ev| matches!(
        ev,
        ExecEvent::RunDone { ok: true, .. }
    )));

    // A dry run never touches the filesystem.
    assert!(!ws.root.exists());
}
