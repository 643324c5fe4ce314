use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use toml::Value;

use crate::error::{Error, Result};

/// A manifest document after `extends` resolution. The typed model in
/// `manifest` is built from this.
#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

/// Deep-merge `overlay` into `base`: tables merge key by key, everything
/// else is replaced by the overlay value.
pub fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_tbl), Value::Table(overlay_tbl)) => {
            for (k, v) in overlay_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => {
            *slot = v;
        }
    }
}

fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn load_value_inner(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::config(format!(
            "manifest extends cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read manifest {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))?;

    // Root-level single-parent extends: the parent is loaded first, then the
    // child is merged over it.
    let mut out = Value::Table(Default::default());
    if let Some(ext) = value.get("extends").and_then(Value::as_str) {
        let base_path = resolve_ref_path(path, ext);
        out = load_value_inner(&base_path, stack)?;
    }
    if let Some(tbl) = value.as_table_mut() {
        tbl.remove("extends");
    }

    merge(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut stack = HashSet::<PathBuf>::new();
    let value = load_value_inner(path, &mut stack)?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_overlays_tables_and_replaces_scalars() {
        let mut base: Value = toml::from_str(
            r#"
[release]
version = "1.0.0"
requires = ["a_1"]
"#,
        )
        .unwrap();
        let overlay: Value = toml::from_str(
            r#"
[release]
version = "2.0.0"

[sources.bsp]
repo = "https://example.com/bsp.git"
"#,
        )
        .unwrap();

        merge(&mut base, overlay);

        assert_eq!(
            base.get("release").and_then(|r| r.get("version")).and_then(Value::as_str),
            Some("2.0.0")
        );
        // Untouched keys from the base survive the merge.
        assert!(base.get("release").and_then(|r| r.get("requires")).is_some());
        assert!(base.get("sources").and_then(|s| s.get("bsp")).is_some());
    }

    #[test]
    fn extends_loads_parent_then_child() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let parent = tmp.path().join("base.toml");
        let child = tmp.path().join("release.toml");
        fs::write(
            &parent,
            r#"
[release]
version = "0.0.0"
depends = ["swi-framework_latest"]
"#,
        )
        .unwrap();
        fs::write(
            &child,
            r#"
extends = "base.toml"

[release]
version = "1.2.3"
"#,
        )
        .unwrap();

        let doc = load(&child).expect("load should succeed");
        let release = doc.value.get("release").unwrap();
        assert_eq!(release.get("version").and_then(Value::as_str), Some("1.2.3"));
        assert!(release.get("depends").is_some());
        assert!(doc.value.get("extends").is_none());
    }

    #[test]
    fn extends_cycle_is_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let a = tmp.path().join("a.toml");
        let b = tmp.path().join("b.toml");
        fs::write(&a, "extends = \"b.toml\"\n").unwrap();
        fs::write(&b, "extends = \"a.toml\"\n").unwrap();

        let err = load(&a).expect_err("cycle must fail");
        assert!(matches!(err, Error::Config(_)), "got {err}");
    }
}
