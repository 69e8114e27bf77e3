//! The Verifier (spec §4.7): byte-for-byte comparison of two call logs and
//! two files archives, used to decide whether a replay reproduced the
//! original execution exactly.

use std::path::Path;

use crate::archive::{self, VersionedArchive};
use crate::error::{CoreError, CoreResult};
use crate::ledger::AppendOnlyLog;

/// The result of [`compare_logs`].
#[derive(Debug, Clone, PartialEq)]
pub struct LogComparison {
    pub matches: bool,
    pub first_divergence: Option<Divergence>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Divergence {
    pub sequence: usize,
    pub reason: String,
}

impl LogComparison {
    /// Turns a non-match into a [`CoreError::VerifierMismatch`], for
    /// callers (the CLI, the RPC adapter) that want a single
    /// `CoreResult<()>` rather than inspecting the comparison themselves.
    pub fn into_result(self) -> CoreResult<()> {
        match self.first_divergence {
            None => Ok(()),
            Some(d) => Err(CoreError::VerifierMismatch(format!(
                "sequence {}: {}",
                d.sequence, d.reason
            ))),
        }
    }
}

/// Compares every entry of two call logs in order. Two logs "match" only
/// if they have the same length and every entry is identical —
/// `methodName`, `args`, `userId`, and the recorded `res`/`err`/
/// `filesVersion` all included, since a replay that produced the right
/// return value via the wrong archive side effects is still a divergence.
pub fn compare_logs(a: &dyn AppendOnlyLog, b: &dyn AppendOnlyLog) -> CoreResult<LogComparison> {
    let a_entries = a.list(0, None)?;
    let b_entries = b.list(0, None)?;

    let shortest = a_entries.len().min(b_entries.len());
    for (sequence, (x, y)) in a_entries.iter().zip(b_entries.iter()).enumerate() {
        if x != y {
            return Ok(LogComparison {
                matches: false,
                first_divergence: Some(Divergence {
                    sequence,
                    reason: "entry contents differ".into(),
                }),
            });
        }
    }

    if a_entries.len() != b_entries.len() {
        return Ok(LogComparison {
            matches: false,
            first_divergence: Some(Divergence {
                sequence: shortest,
                reason: format!(
                    "log lengths differ ({} vs {})",
                    a_entries.len(),
                    b_entries.len()
                ),
            }),
        });
    }

    Ok(LogComparison {
        matches: true,
        first_divergence: None,
    })
}

/// The result of [`compare_archives`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ArchiveComparison {
    pub matches: bool,
    /// Set when the two archives' `version` counters disagree — spec §4.7
    /// requires this to fail verification even if every file's contents
    /// happen to agree.
    pub version_mismatch: Option<(u64, u64)>,
    pub only_in_a: Vec<String>,
    pub only_in_b: Vec<String>,
    pub differing: Vec<String>,
}

impl ArchiveComparison {
    pub fn into_result(self) -> CoreResult<()> {
        if self.matches {
            return Ok(());
        }
        if let Some((a, b)) = self.version_mismatch {
            return Err(CoreError::VerifierMismatch(format!(
                "archive versions differ: {a} vs {b}"
            )));
        }
        Err(CoreError::VerifierMismatch(format!(
            "archives differ: {} only in a, {} only in b, {} with differing contents",
            self.only_in_a.len(),
            self.only_in_b.len(),
            self.differing.len()
        )))
    }
}

/// Byte-for-byte comparison of every file under two archives, plus their
/// `version` counters (spec §4.7: verification fails unless both the
/// contents and the versions agree).
pub fn compare_archives(
    a: &dyn VersionedArchive,
    a_root: &Path,
    b: &dyn VersionedArchive,
    b_root: &Path,
) -> CoreResult<ArchiveComparison> {
    let (a_version, b_version) = (a.version(), b.version());
    let version_mismatch = (a_version != b_version).then_some((a_version, b_version));

    let a_files = archive::snapshot(a_root)?;
    let b_files = archive::snapshot(b_root)?;

    let mut only_in_a = Vec::new();
    let mut differing = Vec::new();
    for (path, bytes) in &a_files {
        match b_files.get(path) {
            Some(other) if other == bytes => {}
            Some(_) => differing.push(path.clone()),
            None => only_in_a.push(path.clone()),
        }
    }
    let only_in_b: Vec<String> = b_files
        .keys()
        .filter(|p| !a_files.contains_key(*p))
        .cloned()
        .collect();

    let matches = version_mismatch.is_none()
        && only_in_a.is_empty()
        && only_in_b.is_empty()
        && differing.is_empty();
    Ok(ArchiveComparison {
        matches,
        version_mismatch,
        only_in_a,
        only_in_b,
        differing,
    })
}
