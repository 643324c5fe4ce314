use serde::Deserialize;
use serde::de::DeserializeOwned;
use toml::Value;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::store::{PackageId, Role};

/// Release-wide metadata shared by every target build.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ReleaseSpec {
    pub version: String,
    /// Package ids added to the "requires" list of every master package.
    pub requires: Vec<String>,
    /// Package ids added to the dependency list of every target build.
    pub depends: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadSpec {
    pub url: String,
    /// Directory the file lands in, relative to the board support tree root.
    pub dir: String,
    #[serde(default)]
    pub unpack: Option<String>,
}

impl DownloadSpec {
    pub fn file_name(&self) -> &str {
        self.url.rsplit('/').next().unwrap_or(&self.url)
    }
}

/// The board support tree: cloned once per release, shared by all targets.
#[derive(Debug, Clone, Deserialize)]
pub struct BspSource {
    pub repo: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    #[serde(default)]
    pub downloads: Vec<DownloadSpec>,
}

fn default_root_dir() -> String {
    ".".into()
}

/// The application framework source, fetched with the manifest-driven
/// multi-repository tool.
#[derive(Debug, Clone, Deserialize)]
pub struct FrameworkSource {
    pub manifest_repo: String,
    pub base_manifest: String,
    /// Subdirectory of the fetch directory where the build tree lives.
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloudAgentSource {
    pub repo: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    /// Version string reported to the cloud by the built agent.
    pub version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OsOverlayRepo {
    pub url: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    /// Checkout directory relative to the OS source tree root.
    pub dir: String,
}

/// Custom OS distribution build for one target: a source manifest plus
/// overlay repositories cloned into the source tree before building.
#[derive(Debug, Clone, Deserialize)]
pub struct OsBuildSpec {
    pub manifest_repo: String,
    pub base_manifest: String,
    #[serde(default)]
    pub add: Vec<OsOverlayRepo>,
}

#[derive(Debug, Clone, Deserialize)]
struct TargetConfig {
    depends: Vec<String>,
    modem_firmware: String,
    #[serde(default)]
    requires: Vec<String>,
    #[serde(default)]
    os: Option<OsBuildSpec>,
}

/// One board + radio module combination to build for.
#[derive(Debug, Clone)]
pub struct TargetSpec {
    pub board: String,
    pub module: String,
    pub depends: Vec<String>,
    pub requires: Vec<String>,
    pub modem_firmware: String,
    pub os: Option<OsBuildSpec>,
}

impl TargetSpec {
    pub fn key(&self) -> String {
        format!("{}-{}", self.board, self.module)
    }

    pub fn abbreviated_module(&self) -> &str {
        crate::store::abbreviated_module(&self.module)
    }
}

/// The validated, immutable build specification for one release run.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub release: ReleaseSpec,
    pub bsp: BspSource,
    pub framework: Option<FrameworkSource>,
    pub cloud_agent: Option<CloudAgentSource>,
    /// Grouped by board, then module, in deterministic (sorted) order.
    pub targets: Vec<TargetSpec>,
}

fn section<T: DeserializeOwned>(doc: &ConfigDoc, path: &str) -> Result<Option<T>> {
    let mut cur = &doc.value;
    for seg in path.split('.') {
        match cur.get(seg) {
            Some(v) => cur = v,
            None => return Ok(None),
        }
    }
    let parsed = cur.clone().try_into().map_err(|e| {
        Error::config(format!(
            "invalid [{path}] section in {}: {e}",
            doc.path.display()
        ))
    })?;
    Ok(Some(parsed))
}

impl Manifest {
    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        let release: ReleaseSpec = section(doc, "release")?
            .ok_or_else(|| Error::config("manifest is missing the [release] section"))?;
        if release.version.trim().is_empty() {
            return Err(Error::config("release.version must be set"));
        }

        let bsp: BspSource = section(doc, "sources.bsp")?
            .ok_or_else(|| Error::config("manifest is missing [sources.bsp]"))?;
        let framework: Option<FrameworkSource> = section(doc, "sources.framework")?;
        let cloud_agent: Option<CloudAgentSource> = section(doc, "sources.cloud_agent")?;

        let targets = parse_targets(doc)?;
        if targets.is_empty() {
            return Err(Error::config("manifest declares no [boards.<board>.<module>] targets"));
        }

        Ok(Self {
            release,
            bsp,
            framework,
            cloud_agent,
            targets,
        })
    }

    pub fn target(&self, board: &str, module: &str) -> Option<&TargetSpec> {
        self.targets
            .iter()
            .find(|t| t.board == board && t.module == module)
    }

    /// Package ids installed into the profile when building for `target`:
    /// the release-wide list, the target-specific list, and (when the target
    /// carries an OS-build overlay) the toolchain and linux-image packages
    /// produced for that exact target.
    pub fn build_depends(&self, target: &TargetSpec) -> Vec<String> {
        let mut out = self.release.depends.clone();
        out.extend(target.depends.iter().cloned());
        if target.os.is_some() {
            let version = &self.release.version;
            out.push(
                PackageId::new(Role::Toolchain, &target.board, &target.module, version).to_string(),
            );
            out.push(
                PackageId::new(Role::LinuxImage, &target.board, &target.module, version)
                    .to_string(),
            );
        }
        out
    }

    /// Package ids for the "requires" list of the target's master package.
    pub fn requires_for(&self, target: &TargetSpec) -> Vec<String> {
        let mut out = self.release.requires.clone();
        out.extend(target.requires.iter().cloned());
        out
    }
}

fn parse_targets(doc: &ConfigDoc) -> Result<Vec<TargetSpec>> {
    let Some(boards) = doc.value.get("boards").and_then(Value::as_table) else {
        return Ok(Vec::new());
    };

    let mut board_names: Vec<&String> = boards.keys().collect();
    board_names.sort();

    let mut out = Vec::new();
    for board in board_names {
        let Some(modules) = boards.get(board).and_then(Value::as_table) else {
            return Err(Error::config(format!(
                "boards.{board} must be a table of modules"
            )));
        };
        let mut module_names: Vec<&String> = modules.keys().collect();
        module_names.sort();

        for module in module_names {
            let raw = modules.get(module).expect("module key exists").clone();
            let cfg: TargetConfig = raw.try_into().map_err(|e| {
                Error::config(format!("invalid target boards.{board}.{module}: {e}"))
            })?;
            if cfg.modem_firmware.trim().is_empty() {
                return Err(Error::config(format!(
                    "boards.{board}.{module}.modem_firmware must be set"
                )));
            }
            out.push(TargetSpec {
                board: board.clone(),
                module: module.clone(),
                depends: cfg.depends,
                requires: cfg.requires,
                modem_firmware: cfg.modem_firmware,
                os: cfg.os,
            });
        }
    }
    Ok(out)
}
