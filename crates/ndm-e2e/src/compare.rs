//! Host versus workload output comparison.
//!
//! The workload mounts the host root filesystem under a remap prefix, so
//! mount paths seen inside the pod carry that prefix. Both comparisons
//! strip it from both sides before comparing, which keeps them symmetric.
//! Nothing here performs I/O.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// Where the workload mounts the host root filesystem.
pub const DEFAULT_REMAP_PREFIX: &str = "/etc/hosts";

/// Fields holding mount paths in `lsblk -J` output. Newer util-linux
/// releases emit a `mountpoints` list instead of a single `mountpoint`.
const MOUNT_FIELDS: &[&str] = &["mountpoint", "mountpoints"];

/// Everything that is not part of a device name, path or index.
static FORMATTING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^a-zA-Z0-9./\[\]]").expect("Invalid formatting regex")
});

/// Maps remapped mount paths back to host paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRemap {
    prefix: String,
}

impl MountRemap {
    /// Create a remap for `prefix`. A trailing slash is ignored.
    #[must_use]
    pub fn new(prefix: &str) -> Self {
        let trimmed = prefix.trim_end_matches('/');
        Self {
            prefix: trimmed.to_string(),
        }
    }

    /// Map a single mount path back to the host. Only a leading prefix
    /// that ends at a path component boundary is stripped.
    #[must_use]
    pub fn normalize(&self, path: &str) -> String {
        if self.prefix.is_empty() {
            return path.to_string();
        }
        if path == self.prefix {
            return "/".to_string();
        }
        match path
            .strip_prefix(self.prefix.as_str())
            .filter(|rest| rest.starts_with('/'))
        {
            Some(rest) => rest.to_string(),
            None => path.to_string(),
        }
    }

    /// Replace `<prefix>/` with `/`, then a bare `<prefix>` with `/`,
    /// anywhere in `text`. Flattened listings have no path boundaries left.
    fn normalize_text(&self, text: &str) -> String {
        if self.prefix.is_empty() {
            return text.to_string();
        }
        text.replace(&format!("{}/", self.prefix), "/")
            .replace(&self.prefix, "/")
    }
}

impl Default for MountRemap {
    fn default() -> Self {
        Self::new(DEFAULT_REMAP_PREFIX)
    }
}

/// First difference found between host and workload output.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("mismatch at {path}: host {host}, workload {workload}")]
pub struct Mismatch {
    /// Location of the difference, e.g. `blockdevices[0].children[1].mountpoint`.
    pub path: String,
    pub host: String,
    pub workload: String,
}

/// Compare two device trees structurally.
///
/// Objects must have the same key set, lists the same length with elements
/// compared by position. Mount fields are compared after remap
/// normalization; every other scalar must be equal.
///
/// # Errors
///
/// Returns the first [`Mismatch`] found.
pub fn trees_match(host: &Value, workload: &Value, remap: &MountRemap) -> Result<(), Mismatch> {
    compare_node("$", host, workload, None, remap)
}

fn compare_node(
    path: &str,
    host: &Value,
    workload: &Value,
    field: Option<&str>,
    remap: &MountRemap,
) -> Result<(), Mismatch> {
    match (host, workload) {
        (Value::Object(h), Value::Object(w)) => {
            if h.len() != w.len() || !h.keys().all(|k| w.contains_key(k)) {
                return Err(Mismatch {
                    path: path.to_string(),
                    host: format!("keys {:?}", h.keys().collect::<Vec<_>>()),
                    workload: format!("keys {:?}", w.keys().collect::<Vec<_>>()),
                });
            }
            for (key, hv) in h {
                let wv = &w[key];
                compare_node(&join(path, key), hv, wv, Some(key.as_str()), remap)?;
            }
            Ok(())
        }
        (Value::Array(h), Value::Array(w)) => {
            if h.len() != w.len() {
                return Err(Mismatch {
                    path: path.to_string(),
                    host: format!("{} elements", h.len()),
                    workload: format!("{} elements", w.len()),
                });
            }
            for (i, (hv, wv)) in h.iter().zip(w).enumerate() {
                compare_node(&format!("{path}[{i}]"), hv, wv, field, remap)?;
            }
            Ok(())
        }
        (Value::String(h), Value::String(w))
            if field.is_some_and(|f| MOUNT_FIELDS.contains(&f)) =>
        {
            if remap.normalize(h) == remap.normalize(w) {
                Ok(())
            } else {
                Err(mismatch(path, host, workload))
            }
        }
        _ if host == workload => Ok(()),
        _ => Err(mismatch(path, host, workload)),
    }
}

fn join(path: &str, key: &str) -> String {
    if path == "$" {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn mismatch(path: &str, host: &Value, workload: &Value) -> Mismatch {
    Mismatch {
        path: path.to_string(),
        host: host.to_string(),
        workload: workload.to_string(),
    }
}

/// Strip formatting characters and normalize mount paths.
#[must_use]
pub fn flatten_listing(text: &str, remap: &MountRemap) -> String {
    remap.normalize_text(&FORMATTING.replace_all(text, ""))
}

/// Compare two table-formatted listings, ignoring layout.
///
/// # Errors
///
/// Returns a [`Mismatch`] pointing at the first differing character of
/// the flattened text.
pub fn listings_match(host: &str, workload: &str, remap: &MountRemap) -> Result<(), Mismatch> {
    let h = flatten_listing(host, remap);
    let w = flatten_listing(workload, remap);
    if h == w {
        return Ok(());
    }

    let offset = h
        .chars()
        .zip(w.chars())
        .take_while(|(a, b)| a == b)
        .count();
    let excerpt = |s: &str| s.chars().skip(offset).take(40).collect::<String>();

    Err(Mismatch {
        path: format!("offset {offset}"),
        host: format!("{:?}", excerpt(&h)),
        workload: format!("{:?}", excerpt(&w)),
    })
}
