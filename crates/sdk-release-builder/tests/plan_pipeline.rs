//! Plan-shape tests over a realistic two-target manifest: stage ordering
//! inside one target, strict serialization between targets, and the
//! optional-stage handling when a manifest omits sources.

use sdk_release_builder::config::ConfigDoc;
use sdk_release_builder::manifest::Manifest;
use sdk_release_builder::planner::Task;
use sdk_release_builder::stages::plan_release;

const FULL: &str = r#"
[release]
version = "2.0.0"
depends = ["swi-vscode-support_latest"]

[sources.bsp]
repo = "https://example.com/bsp.git"
ref = "abc123"

[sources.framework]
manifest_repo = "https://example.com/manifest.git"
base_manifest = "releases/fw.xml"
root_dir = "framework"

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
"#;

fn manifest(toml_text: &str) -> Manifest {
    let doc = ConfigDoc {
        path: "<mem>".into(),
        value: toml::from_str(toml_text).expect("fixture parses"),
    };
    Manifest::from_doc(&doc).expect("fixture validates")
}

fn position(ordered: &[&Task], id: &str) -> usize {
    ordered
        .iter()
        .position(|t| t.id == id)
        .unwrap_or_else(|| panic!("task {id} missing from plan"))
}

#[test]
fn full_manifest_plans_every_stage_in_order() {
    let plan = plan_release(&manifest(FULL)).expect("plan");
    let ordered = plan.ordered().expect("order");

    let init = position(&ordered, "store.init");
    for fetch in ["bsp.fetch", "framework.fetch", "cloud.fetch"] {
        assert!(init < position(&ordered, fetch), "{fetch} must follow init");
    }

    // Within one target: framework -> cloud agent -> image.
    let fw = position(&ordered, "framework.build:red-wp85");
    let cloud = position(&ordered, "cloud.build:red-wp85");
    let image = position(&ordered, "image.build:red-wp85");
    assert!(position(&ordered, "framework.fetch") < fw);
    assert!(fw < cloud && cloud < image);

    // The OS distribution build precedes the overlay target's framework build.
    let osdist = position(&ordered, "osdist.build:yellow-wp76xx");
    assert!(osdist < position(&ordered, "framework.build:yellow-wp76xx"));
    // The plain target gets no OS distribution task at all.
    assert!(plan.get("osdist.build:red-wp85").is_none());
}

#[test]
fn targets_are_strictly_serialized() {
    let plan = plan_release(&manifest(FULL)).expect("plan");
    let ordered = plan.ordered().expect("order");

    // Targets run in sorted order: every red task finishes before any
    // yellow per-target task starts.
    let red_image = position(&ordered, "image.build:red-wp85");
    for task in &ordered {
        if task
            .target
            .as_ref()
            .is_some_and(|t| t.board == "yellow")
        {
            assert!(
                position(&ordered, &task.id) > red_image,
                "{} ran before the previous target finished",
                task.id
            );
        }
    }
}

#[test]
fn omitted_sources_omit_their_stages() {
    let minimal = manifest(
        r#"
[release]
version = "1.0.0"

[sources.bsp]
repo = "https://example.com/bsp.git"
ref = "abc"

[boards.red.wp85]
depends = []
modem_firmware = "fw.spk"
"#,
    );
    let plan = plan_release(&minimal).expect("plan");
    assert!(plan.get("framework.fetch").is_none());
    assert!(plan.get("cloud.fetch").is_none());
    assert!(plan.get("framework.build:red-wp85").is_none());
    assert!(plan.get("cloud.build:red-wp85").is_none());

    // The image build's optional deps on the omitted stages resolve away.
    let ordered = plan.ordered().expect("order");
    let ids: Vec<&str> = ordered.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["store.init", "bsp.fetch", "image.build:red-wp85"]);
}

#[test]
fn dot_output_names_the_serialization_edges() {
    let plan = plan_release(&manifest(FULL)).expect("plan");
    let dot = plan.to_dot().expect("dot");
    assert!(dot.starts_with("digraph plan {"));
    assert!(dot.contains("\"store.init\" -> \"bsp.fetch\""));
    assert!(dot.contains("\"image.build:red-wp85\" -> \"osdist.build:yellow-wp76xx\""));
}
