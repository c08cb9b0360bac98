//! Configuration patching with guaranteed restore.
//!
//! `ConfigPatcher::patch` copies the pristine file to a sidecar backup,
//! rewrites the named `Parameter` entries and hands back a
//! [`PatchTransaction`]. Dropping the transaction (or calling `release`)
//! moves the backup over the patched file. A [`PatchSet`] owns every
//! transaction of one run and releases them in reverse creation order.

pub mod document;

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::config::PatchConfig;
use crate::types::{ComputeDevice, ParameterPatch, Result, RunnerError};

pub use document::{ConfigDocument, DocumentError, PatchSummary};

// ---------------------------------------------------------------------------
// Patcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ConfigPatcher {
    backup_suffix: String,
}

impl ConfigPatcher {
    pub fn new(config: &PatchConfig) -> Self {
        Self {
            backup_suffix: config.backup_suffix.clone(),
        }
    }

    /// `<path><suffix>`, e.g. `ore.xml.bak_gpu_patch`.
    pub fn backup_path(&self, path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(&self.backup_suffix);
        PathBuf::from(name)
    }

    /// Back up `path`, then apply `patches` to it in order.
    ///
    /// Any failure after the backup was taken restores the file before the
    /// error is returned.
    pub fn patch(&self, path: &Path, patches: &[ParameterPatch]) -> Result<PatchTransaction> {
        let io_err = |source| RunnerError::ConfigIo {
            path: path.to_path_buf(),
            source,
        };

        let backup = self.backup_path(path);
        if backup.exists() {
            warn!(backup = %backup.display(), "Removing stale backup from an earlier run");
            fs::remove_file(&backup).map_err(io_err)?;
        }
        fs::copy(path, &backup).map_err(io_err)?;

        let transaction = PatchTransaction {
            original: path.to_path_buf(),
            backup,
            applied: true,
        };

        let bytes = fs::read(path).map_err(io_err)?;
        let mut doc = ConfigDocument::from_bytes(&bytes).map_err(|e| RunnerError::ConfigParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let mut total = PatchSummary::default();
        for patch in patches {
            let summary = doc.apply(patch);
            debug!(
                file = %path.display(),
                value = %patch.value,
                updated = summary.updated,
                created = summary.created,
                "Applied parameter patch"
            );
            total.updated += summary.updated;
            total.created += summary.created;
        }

        let bytes = doc.to_bytes().map_err(|e| RunnerError::ConfigParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        fs::write(path, bytes).map_err(io_err)?;

        info!(
            file = %path.display(),
            updated = total.updated,
            created = total.created,
            "Patched configuration"
        );
        Ok(transaction)
    }

    /// Restore the original file; a no-op once already restored.
    pub fn restore(&self, transaction: &mut PatchTransaction) -> bool {
        transaction.release()
    }
}

/// Patches that point the engine at `device`: the tag itself plus the
/// enable flags that make the engine honour it.
pub fn device_patches(device: &ComputeDevice, config: &PatchConfig) -> Vec<ParameterPatch> {
    let mut patches = Vec::with_capacity(2);
    if !config.device_names.is_empty() {
        patches.push(ParameterPatch::new(
            config.device_names.iter().cloned(),
            device.tag(),
        ));
    }
    if !config.enable_names.is_empty() {
        patches.push(ParameterPatch::new(
            config.enable_names.iter().cloned(),
            config.enable_value.clone(),
        ));
    }
    patches
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// One backed-up, patched file. Restored exactly once: explicitly via
/// [`PatchTransaction::release`] or implicitly on drop.
#[must_use = "dropping a PatchTransaction restores the file immediately"]
#[derive(Debug)]
pub struct PatchTransaction {
    original: PathBuf,
    backup: PathBuf,
    applied: bool,
}

impl PatchTransaction {
    pub fn original_path(&self) -> &Path {
        &self.original
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup
    }

    pub fn is_applied(&self) -> bool {
        self.applied
    }

    /// Move the backup over the patched file. Failures are logged and
    /// reported as `false`; they never propagate.
    pub fn release(&mut self) -> bool {
        if !self.applied {
            return true;
        }
        self.applied = false;
        match fs::rename(&self.backup, &self.original) {
            Ok(()) => {
                debug!(file = %self.original.display(), "Restored configuration");
                true
            }
            Err(e) => {
                error!(
                    file = %self.original.display(),
                    backup = %self.backup.display(),
                    error = %e,
                    "Failed to restore configuration"
                );
                false
            }
        }
    }
}

impl Drop for PatchTransaction {
    fn drop(&mut self) {
        self.release();
    }
}

/// All transactions of one run.
#[derive(Debug, Default)]
pub struct PatchSet {
    transactions: Vec<PatchTransaction>,
}

impl PatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, transaction: PatchTransaction) {
        self.transactions.push(transaction);
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.transactions.iter().map(PatchTransaction::original_path)
    }

    /// Restore newest first. Returns the number of failed restores.
    pub fn restore_all(&mut self) -> usize {
        let mut failed = 0;
        while let Some(mut transaction) = self.transactions.pop() {
            if !transaction.release() {
                failed += 1;
            }
        }
        failed
    }
}

impl Drop for PatchSet {
    fn drop(&mut self) {
        self.restore_all();
    }
}
