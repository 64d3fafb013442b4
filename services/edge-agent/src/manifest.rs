//! On-disk manifest trees.
//!
//! Each stack owns two directory trees: the *live* tree the deployer
//! works against, and a *success* tree snapshotted after every
//! successful deploy. Removal runs against the success tree so that
//! tear-down keeps working even after the live tree has been rewritten.
//! Relative-path stacks are additionally materialized at a host-visible
//! path.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::Engine;
use tracing::{debug, warn};

use crate::client::DirEntry;

/// Success directory sibling of a live manifest directory.
pub fn success_folder(live: &Path) -> PathBuf {
    let mut name = live
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str("-success");
    live.with_file_name(name)
}

/// Decode base64 file contents in place. Directory entries are left
/// untouched.
pub fn decode_dir_entries(entries: &mut [DirEntry]) -> Result<()> {
    for entry in entries.iter_mut() {
        if !entry.is_file {
            continue;
        }

        let raw = base64::engine::general_purpose::STANDARD
            .decode(entry.content.as_bytes())
            .with_context(|| format!("decoding manifest file {}", entry.name))?;
        entry.content = String::from_utf8(raw)
            .with_context(|| format!("manifest file {} is not utf-8", entry.name))?;
    }

    Ok(())
}

/// Write a decoded manifest tree under `folder`, applying file
/// permission bits where the payload carries them.
pub fn persist_dir(folder: &Path, entries: &[DirEntry]) -> Result<()> {
    fs::create_dir_all(folder).with_context(|| format!("creating {}", folder.display()))?;

    for entry in entries {
        let path = folder.join(&entry.name);

        if !entry.is_file {
            fs::create_dir_all(&path).with_context(|| format!("creating {}", path.display()))?;
            continue;
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, &entry.content)
            .with_context(|| format!("writing {}", path.display()))?;

        #[cfg(unix)]
        if entry.permissions != 0 {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(entry.permissions))
                .with_context(|| format!("setting permissions on {}", path.display()))?;
        }
    }

    debug!(folder = %folder.display(), entries = entries.len(), "manifest tree persisted");
    Ok(())
}

/// Snapshot the live tree into the success tree, replacing any previous
/// snapshot.
pub fn snapshot_success(live: &Path) -> Result<()> {
    let success = success_folder(live);
    if success.exists() {
        fs::remove_dir_all(&success)
            .with_context(|| format!("clearing {}", success.display()))?;
    }
    copy_tree(live, &success)
}

/// Materialize the live tree at the host-visible path for a
/// relative-path stack.
pub fn copy_to_host(live: &Path, host: &Path, stack_id: i64, stack_name: &str) -> Result<()> {
    debug!(
        stack_id,
        stack_name,
        host = %host.display(),
        "copying manifest tree to host path"
    );

    if host.exists() {
        fs::remove_dir_all(host).with_context(|| format!("clearing {}", host.display()))?;
    }
    copy_tree(live, host)
}

/// Best-effort removal of the host-visible tree.
pub fn remove_from_host(host: &Path, stack_id: i64, stack_name: &str) {
    debug!(
        stack_id,
        stack_name,
        host = %host.display(),
        "removing manifest tree from host path"
    );
    remove_tree(host);
}

/// Best-effort removal of both the live and the success trees.
pub fn remove_stack_dirs(live: &Path) {
    remove_tree(live);
    remove_tree(&success_folder(live));
}

fn remove_tree(path: &Path) {
    if !path.exists() {
        return;
    }
    if let Err(e) = fs::remove_dir_all(path) {
        warn!(path = %path.display(), error = %e, "unable to remove manifest tree");
    }
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("creating {}", dst.display()))?;

    for entry in fs::read_dir(src).with_context(|| format!("reading {}", src.display()))? {
        let entry = entry?;
        let target = dst.join(entry.file_name());

        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("copying {}", entry.path().display()))?;
        }
    }

    Ok(())
}
