//! Package identity and the file-based package store the release publishes
//! into. The store is a directory of `.leaf` archives plus a generated
//! `index.json`; the package manager consumes it as a remote.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::checkpoint::prep_clean_dir;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::runner::command_in;
use crate::workspace::{Workspace, list_files_with_suffix};

pub const INDEX_FILE: &str = "index.json";
pub const REMOTE_NAME: &str = "release-store";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Toolchain,
    LinuxImage,
    Framework,
    CloudAgent,
    Master,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Toolchain => "toolchain",
            Self::LinuxImage => "linux-image",
            Self::Framework => "framework",
            Self::CloudAgent => "cloud-agent",
            Self::Master => "master",
        }
    }
}

/// Identity of one published package: `{role}-{board}-{module}_{version}`.
/// The part before the underscore is the package name; the underscore
/// separates name from version in every package manager surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageId {
    pub role: Role,
    pub board: String,
    pub module: String,
    pub version: String,
}

impl PackageId {
    pub fn new(
        role: Role,
        board: impl Into<String>,
        module: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            role,
            board: board.into(),
            module: module.into(),
            version: version.into(),
        }
    }

    pub fn name(&self) -> String {
        format!("{}-{}-{}", self.role.as_str(), self.board, self.module)
    }
}

impl std::fmt::Display for PackageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.name(), self.version)
    }
}

/// Strip a trailing `_latest` version so a floating dependency resolves to
/// whatever the remote currently serves.
pub fn strip_latest(package_id: &str) -> &str {
    package_id.strip_suffix("_latest").unwrap_or(package_id)
}

/// Short module family name used in modem firmware paths: trailing `x` and
/// `0` placeholders are dropped (wp76xx and wp750x are the wp76 and wp75
/// families on disk).
pub fn abbreviated_module(module: &str) -> &str {
    module.trim_end_matches(['x', '0'])
}

/// Content of a package's `manifest.json`, consumed by `leaf build pack`.
#[derive(Debug, Serialize)]
pub struct PackageManifest {
    pub info: PackageInfo,
}

#[derive(Debug, Serialize)]
pub struct PackageInfo {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub master: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
}

/// Write `manifest.json` at the root of a staged package directory.
pub fn write_package_manifest(staged_dir: &Path, manifest: &PackageManifest) -> Result<()> {
    let path = staged_dir.join("manifest.json");
    let body = serde_json::to_string_pretty(manifest)
        .map_err(|e| Error::packaging(format!("failed to encode manifest.json: {e}")))?;
    fs::write(&path, body)
        .map_err(|e| Error::packaging(format!("failed to write {}: {e}", path.display())))
}

pub struct Store {
    root: PathBuf,
    remote_dir: PathBuf,
    cache_dir: PathBuf,
    install_root: PathBuf,
    staging_root: PathBuf,
}

impl Store {
    pub fn new(ws: &Workspace) -> Self {
        Self {
            root: ws.root.clone(),
            remote_dir: ws.store_remote_dir(),
            cache_dir: ws.store_cache_dir(),
            install_root: ws.store_install_root(),
            staging_root: ws.staging_root(),
        }
    }

    pub fn index_url(&self) -> String {
        format!("file://{}", self.remote_dir.join(INDEX_FILE).display())
    }

    /// Point the sandboxed package manager at this store. The stale remote
    /// from a previous run is dropped first; removal failure just means no
    /// such remote existed yet. Remote commands run from the build root so
    /// the package manager's workspace stays inside it.
    pub fn register_remote(&self, ctx: &ExecCtx) -> Result<()> {
        let mut remove = command_in(&self.root, "leaf");
        remove.args(["remote", "remove", REMOTE_NAME]);
        ctx.run_cmd_unchecked(remove)?;

        let mut add = command_in(&self.root, "leaf");
        add.args(["remote", "add", REMOTE_NAME, &self.index_url()]);
        ctx.run_cmd(add)
            .map_err(|e| Error::packaging(format!("leaf remote add failed: {e}")))
    }

    /// Fresh, empty staging directory for assembling one package's payload.
    pub fn stage(&self, package_name: &str) -> Result<PathBuf> {
        let dir = self.staging_root.join(package_name);
        prep_clean_dir(&dir)?;
        Ok(dir)
    }

    /// Pack a staged directory into the remote and refresh the index. Any
    /// artifact a previous run published under the same id is removed first,
    /// so a re-run after a late failure converges instead of accumulating.
    pub fn publish(&self, ctx: &ExecCtx, id: &PackageId, staged_dir: &Path) -> Result<()> {
        self.purge_package_files(&id.to_string())?;

        let archive = self.remote_dir.join(format!("{id}.leaf"));
        let mut pack = command_in(staged_dir, "leaf");
        pack.args(["build", "pack", "-o"])
            .arg(&archive)
            .args(["-i", "."])
            .args(["--", "-J", "."]);
        ctx.run_cmd(pack)
            .map_err(|e| Error::packaging(format!("leaf build pack for {id}: {e}")))?;

        self.rebuild_index(ctx)
    }

    /// Copy pre-built `.leaf` archives (and their `.leaf.info` sidecars) from
    /// `dir` into the remote, then refresh the index.
    pub fn publish_prebuilt(&self, ctx: &ExecCtx, dir: &Path) -> Result<()> {
        let mut names = list_files_with_suffix(dir, ".leaf")?;
        names.extend(list_files_with_suffix(dir, ".leaf.info")?);
        if names.is_empty() {
            return Err(Error::packaging(format!(
                "no .leaf archives found under {}",
                dir.display()
            )));
        }
        for name in &names {
            if ctx.dry_run {
                ctx.log(&format!("DRY-RUN: copy {name} into the package store"));
                continue;
            }
            let from = dir.join(name);
            let to = self.remote_dir.join(name);
            fs::copy(&from, &to).map_err(|e| {
                Error::packaging(format!("failed to copy {} into the store: {e}", from.display()))
            })?;
        }
        self.rebuild_index(ctx)
    }

    /// Remove every trace of a package (remote archive, cached download,
    /// installed copy) and refresh the index. A no-op when nothing matches.
    pub fn remove(&self, ctx: &ExecCtx, id: &PackageId) -> Result<()> {
        let id_str = id.to_string();
        self.purge_package_files(&id_str)?;
        purge_files(&self.cache_dir, &id_str)?;
        let installed = self.install_root.join(&id_str);
        if installed.exists() {
            fs::remove_dir_all(&installed).map_err(|e| {
                Error::packaging(format!("failed to remove {}: {e}", installed.display()))
            })?;
        }
        self.rebuild_index(ctx)
    }

    fn purge_package_files(&self, id: &str) -> Result<()> {
        purge_files(&self.remote_dir, &format!("{id}.leaf"))
    }

    /// Regenerate `index.json` over every archive currently in the remote.
    /// An empty store yields an empty but valid index, so the remote can be
    /// registered before anything is published.
    pub fn rebuild_index(&self, ctx: &ExecCtx) -> Result<()> {
        let archives = self.list_packages()?;
        let mut index = command_in(&self.remote_dir, "leaf");
        index.args(["build", "index", "-o", INDEX_FILE]);
        index.args(&archives);
        ctx.run_cmd(index)
            .map_err(|e| Error::packaging(format!("leaf build index failed: {e}")))
    }

    /// Names of every `.leaf` archive in the remote, sorted.
    pub fn list_packages(&self) -> Result<Vec<String>> {
        list_files_with_suffix(&self.remote_dir, ".leaf")
    }
}

/// Delete every file directly under `dir` whose name starts with `prefix`.
/// Matches both `<id>.leaf` and its `.leaf.info` sidecar.
pub fn purge_files(dir: &Path, prefix: &str) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let entries = fs::read_dir(dir)
        .map_err(|e| Error::packaging(format!("failed to read {}: {e}", dir.display())))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::packaging(e.to_string()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(prefix) {
            fs::remove_file(entry.path()).map_err(|e| {
                Error::packaging(format!("failed to remove {}: {e}", entry.path().display()))
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_id_formatting() {
        let id = PackageId::new(Role::LinuxImage, "yellow", "wp76xx", "2.5.0");
        assert_eq!(id.name(), "linux-image-yellow-wp76xx");
        assert_eq!(id.to_string(), "linux-image-yellow-wp76xx_2.5.0");
        assert_eq!(
            PackageId::new(Role::Master, "red", "wp85", "2.5.0").to_string(),
            "master-red-wp85_2.5.0"
        );
    }

    #[test]
    fn strip_latest_only_touches_the_trailing_marker() {
        assert_eq!(strip_latest("swi-vscode-support_latest"), "swi-vscode-support");
        assert_eq!(strip_latest("pkg_latest_2"), "pkg_latest_2");
        assert_eq!(strip_latest("wp85-toolchain_SWI_1"), "wp85-toolchain_SWI_1");
    }

    #[test]
    fn module_families_are_abbreviated() {
        assert_eq!(abbreviated_module("wp76xx"), "wp76");
        assert_eq!(abbreviated_module("wp750x"), "wp75");
        assert_eq!(abbreviated_module("wp85"), "wp85");
    }

    #[test]
    fn staging_always_starts_empty() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let ws = Workspace::at(tmp.path().join("build"));
        ws.prepare().expect("prepare");
        let store = Store::new(&ws);

        let dir = store.stage("master-red-wp85").expect("stage");
        fs::write(dir.join("leftover"), b"x").unwrap();

        let dir = store.stage("master-red-wp85").expect("restage");
        assert!(dir.exists());
        assert!(!dir.join("leftover").exists());
    }

    #[test]
    fn purge_removes_archive_and_sidecar_but_not_neighbors() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path();
        for name in [
            "master-red-wp85_1.0.leaf",
            "master-red-wp85_1.0.leaf.info",
            "master-red-wp85_1.0.1.leaf",
            "index.json",
        ] {
            fs::write(dir.join(name), b"x").unwrap();
        }

        purge_files(dir, "master-red-wp85_1.0.leaf").expect("purge");
        assert!(!dir.join("master-red-wp85_1.0.leaf").exists());
        assert!(!dir.join("master-red-wp85_1.0.leaf.info").exists());
        assert!(dir.join("master-red-wp85_1.0.1.leaf").exists());
        assert!(dir.join("index.json").exists());
    }

    #[test]
    fn manifest_json_is_written_at_the_staged_root() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let manifest = PackageManifest {
            info: PackageInfo {
                name: "master-red-wp85".into(),
                version: "1.0.0".into(),
                description: Some("Red release".into()),
                master: true,
                depends: vec!["framework-red-wp85_1.0.0".into()],
                requires: vec![],
            },
        };
        write_package_manifest(tmp.path(), &manifest).expect("write");
        let body = fs::read_to_string(tmp.path().join("manifest.json")).unwrap();
        assert!(body.contains("\"master\": true"));
        assert!(body.contains("framework-red-wp85_1.0.0"));
        assert!(!body.contains("requires"));
    }
}
