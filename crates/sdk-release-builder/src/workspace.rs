use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::manifest::{FrameworkSource, TargetSpec};

/// Layout of the private build root. Everything a release run touches —
/// source trees, checkpoints, the package store, staging and the package
/// manager's sandboxed state — lives under one directory so the whole run
/// can be archived or deleted as a unit.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub root: PathBuf,
}

impl Workspace {
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn in_current_dir() -> Result<Self> {
        let cwd = std::env::current_dir()
            .map_err(|e| Error::command(format!("cannot determine current dir: {e}")))?;
        Ok(Self::at(cwd.join("build")))
    }

    /// Create the directory skeleton. Idempotent; never cleans.
    pub fn prepare(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.store_remote_dir(),
            self.store_cache_dir(),
            self.store_config_dir(),
            self.store_install_root(),
            self.staging_root(),
        ] {
            fs::create_dir_all(&dir)
                .map_err(|e| Error::command(format!("failed to create {}: {e}", dir.display())))?;
        }
        Ok(())
    }

    // Source trees.

    pub fn bsp_dir(&self) -> PathBuf {
        self.root.join("bsp")
    }

    pub fn framework_fetch_dir(&self) -> PathBuf {
        self.root.join("framework")
    }

    pub fn framework_root(&self, src: &FrameworkSource) -> PathBuf {
        let fetch = self.framework_fetch_dir();
        if src.root_dir == "." {
            fetch
        } else {
            fetch.join(&src.root_dir)
        }
    }

    pub fn cloud_agent_dir(&self) -> PathBuf {
        self.root.join("cloud-agent")
    }

    pub fn os_build_dir(&self, target: &TargetSpec) -> PathBuf {
        self.root.join(format!("os-{}-{}", target.board, target.module))
    }

    // Package store.

    pub fn store_remote_dir(&self) -> PathBuf {
        self.root.join("store/remote")
    }

    pub fn store_cache_dir(&self) -> PathBuf {
        self.root.join("store/cache")
    }

    pub fn store_config_dir(&self) -> PathBuf {
        self.root.join("store/config")
    }

    pub fn store_install_root(&self) -> PathBuf {
        self.root.join("store/installed")
    }

    pub fn staging_root(&self) -> PathBuf {
        self.root.join("store/staging")
    }

    // Leaf data, written by the package manager when a profile is active.
    // The package manager treats the directory its lifecycle commands run
    // from as its workspace, so every profile command uses the build root as
    // working directory and the data lands here.

    pub fn leaf_data_dir(&self) -> PathBuf {
        self.root.join("leaf-data")
    }

    /// Content of an installed package, as exposed by the active profile.
    pub fn installed_package_dir(&self, package_name: &str) -> PathBuf {
        self.leaf_data_dir().join("current").join(package_name)
    }

    /// Environment that sandboxes the package manager into this workspace.
    /// Merged into every spawned command rather than set on the host process,
    /// so the tool never touches the developer's ambient state.
    pub fn store_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(
            "LEAF_CONFIG".to_string(),
            self.store_config_dir().display().to_string(),
        );
        env.insert(
            "LEAF_CACHE".to_string(),
            self.store_cache_dir().display().to_string(),
        );
        env.insert(
            "LEAF_USER_ROOT".to_string(),
            self.store_install_root().display().to_string(),
        );
        env
    }

    /// Factory image artifacts are copied to the build root itself.
    pub fn output_image_path(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }
}

/// Names of files directly under `dir` matching a simple `*suffix` pattern,
/// sorted. Used for the final artifact listing.
pub fn list_files_with_suffix(dir: &Path, suffix: &str) -> Result<Vec<String>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    let entries = fs::read_dir(dir)
        .map_err(|e| Error::command(format!("failed to read {}: {e}", dir.display())))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::command(e.to_string()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(suffix) {
            out.push(name);
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;
    use crate::config::ConfigDoc;
    use std::path::PathBuf;

    fn target() -> TargetSpec {
        let doc = ConfigDoc {
            path: PathBuf::from("<mem>"),
            value: toml::from_str(
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
            )
            .unwrap(),
        };
        Manifest::from_doc(&doc).unwrap().targets.remove(0)
    }

    #[test]
    fn per_target_and_store_paths_are_disjoint() {
        let ws = Workspace::at("/tmp/release-build/build");
        let t = target();
        assert_eq!(ws.os_build_dir(&t), PathBuf::from("/tmp/release-build/build/os-red-wp85"));
        assert_ne!(ws.store_remote_dir(), ws.store_cache_dir());
        assert!(ws.store_remote_dir().starts_with(&ws.root));
        assert!(ws.installed_package_dir("wp85-modem-image")
            .ends_with("leaf-data/current/wp85-modem-image"));
    }

    #[test]
    fn store_env_points_into_the_workspace() {
        let ws = Workspace::at("/tmp/rb/build");
        let env = ws.store_env();
        assert_eq!(env.get("LEAF_CONFIG").unwrap(), "/tmp/rb/build/store/config");
        assert_eq!(env.get("LEAF_CACHE").unwrap(), "/tmp/rb/build/store/cache");
        assert_eq!(env.get("LEAF_USER_ROOT").unwrap(), "/tmp/rb/build/store/installed");
    }
}
