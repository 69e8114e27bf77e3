//! The Replay Driver (spec §4.6): reconstructs a VM by re-running every
//! recorded call from a call log against a fresh sandbox and archive,
//! rather than trusting the recorded outcomes.
//!
//! Replay on its own proves nothing about correctness — it just produces
//! a second, independently-generated log and archive. [`crate::verify`]
//! is what actually compares the replay's outputs against the original to
//! decide whether the guest behaved deterministically (spec scenario S4).

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{CoreError, CoreResult};
use crate::ledger::{AppendOnlyLog, GetOptions, LedgerEntry};
use crate::vm::Vm;

/// Caller-supplied expectations checked against a call log's `init` entry
/// before replay proceeds (spec §4.6 point 3).
#[derive(Debug, Clone, Default)]
pub struct ReplayAssertions {
    /// If set, must equal `init.filesArchiveUrl` or replay fails with
    /// [`CoreError::AssertionMismatch`] before any deployment is attempted.
    pub files_archive_url: Option<String>,
}

/// Deploys a fresh VM at `dir` from `log`'s `init` entry, then re-executes
/// every subsequent `call` entry against it in order. The replayed VM's
/// own log and archive are left for the caller to compare against the
/// original with [`crate::verify`].
///
/// Rejects a log containing an `oracle` entry or a second `init` — this
/// crate never constructs either, so encountering one means the log came
/// from somewhere that doesn't share this implementation's assumptions.
pub async fn from_call_log(
    log: &dyn AppendOnlyLog,
    assertions: ReplayAssertions,
    dir: PathBuf,
) -> CoreResult<Arc<Vm>> {
    from_call_log_with_extras(log, assertions, dir, |_| Ok(Vec::new())).await
}

/// As [`from_call_log`], but lets a caller wire the same `System.*` extras
/// (a factory's `vms` table, the `test` namespace) the original deployment
/// used — without them, replaying a call that reaches into an extra
/// namespace the fresh VM never installed fails outright rather than
/// merely diverging.
pub async fn from_call_log_with_extras(
    log: &dyn AppendOnlyLog,
    assertions: ReplayAssertions,
    dir: PathBuf,
    build_extras: impl FnOnce(&mlua::Lua) -> mlua::Result<Vec<(String, mlua::Table)>>,
) -> CoreResult<Arc<Vm>> {
    let (code, files_archive_url) = match log.get(0, GetOptions::default())? {
        LedgerEntry::Init {
            code,
            files_archive_url,
        } => (code, files_archive_url),
        _ => return Err(CoreError::MalformedLog("sequence 0 is not init".into())),
    };

    if let Some(expected) = assertions.files_archive_url {
        if expected != files_archive_url {
            return Err(CoreError::AssertionMismatch {
                expected,
                found: files_archive_url,
            });
        }
    }

    let vm = Vm::deploy_with_extras(dir, "replay".into(), code, build_extras)?;

    for entry in log.list(1, None)? {
        match entry {
            LedgerEntry::Call {
                call, ..
            } => {
                // A guest error during the original run is still a valid
                // replay step — it only becomes a mismatch if the replayed
                // error differs from the recorded one, which is
                // `verify::compare_logs`'s job, not this loop's.
                let _ = vm
                    .execute_call(call.method_name, call.args, call.user_id)
                    .await;
            }
            LedgerEntry::Oracle { .. } => {
                vm.close().await;
                return Err(CoreError::MalformedLog(
                    "replay does not support oracle entries".into(),
                ));
            }
            LedgerEntry::Init { .. } => {
                vm.close().await;
                return Err(CoreError::MalformedLog(
                    "init entry found past sequence 0".into(),
                ));
            }
        }
    }

    Ok(vm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn replays_deterministic_calls_identically() {
        let original_dir = tempdir().unwrap();
        let original = Vm::deploy(
            original_dir.path().to_path_buf(),
            "counter".into(),
            r#"
            local n = 0
            exports.bump = function() n = n + 1 return n end
            "#
            .into(),
        )
        .unwrap();
        for _ in 0..3 {
            original.execute_call("bump", vec![], None).await.unwrap();
        }
        original.close().await;

        let replay_dir = tempdir().unwrap();
        let replayed = from_call_log(
            original.log().as_ref(),
            ReplayAssertions::default(),
            replay_dir.path().to_path_buf(),
        )
        .await
        .unwrap();

        let comparison =
            crate::verify::compare_logs(original.log().as_ref(), replayed.log().as_ref()).unwrap();
        assert!(comparison.matches);
    }

    #[tokio::test]
    async fn files_archive_url_assertion_mismatch_fails_before_deploying() {
        let original_dir = tempdir().unwrap();
        let original = Vm::deploy(
            original_dir.path().to_path_buf(),
            "vm".into(),
            "exports.f = function() return 1 end".into(),
        )
        .unwrap();
        original.close().await;

        let replay_dir = tempdir().unwrap();
        let err = from_call_log(
            original.log().as_ref(),
            ReplayAssertions {
                files_archive_url: Some("archive://bogus".to_string()),
            },
            replay_dir.path().to_path_buf(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::AssertionMismatch { .. }));
    }

    #[tokio::test]
    async fn replay_diverges_when_the_guest_is_not_actually_deterministic() {
        let original_dir = tempdir().unwrap();
        let original = Vm::deploy(
            original_dir.path().to_path_buf(),
            "flaky".into(),
            "exports.roll = function() return System.test.random() end".into(),
        )
        .unwrap();
        // `System.test.random()` isn't wired into a plain `Vm::deploy`
        // call — this asserts the safe default (no nondeterministic
        // primitives unless a caller opts in via `deploy_with_extras`).
        let err = original.execute_call("roll", vec![], None).await.unwrap_err();
        assert!(matches!(err, CoreError::Guest(_)));
    }

    #[tokio::test]
    async fn rejects_a_log_containing_an_oracle_entry() {
        use crate::ledger::LocalLog;

        let log_dir = tempdir().unwrap();
        let log = LocalLog::create(log_dir.path(), "exports.f = function() end", "archive://x")
            .unwrap();
        // There is no public constructor for an `Oracle` entry (this crate
        // never produces one); reach it through the raw JSON line instead,
        // matching how a log from a different implementation might look.
        std::fs::write(
            log_dir.path().join("entries.jsonl"),
            format!(
                "{}\n{{\"type\":\"oracle\",\"name\":\"clock\",\"args\":[],\"res\":0}}\n",
                serde_json::to_string(&log.get(0, GetOptions::default()).unwrap()).unwrap()
            ),
        )
        .unwrap();
        let reopened = LocalLog::open(log_dir.path(), log.url()).unwrap();

        let replay_dir = tempdir().unwrap();
        let err = from_call_log(
            &reopened,
            ReplayAssertions::default(),
            replay_dir.path().to_path_buf(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::MalformedLog(_)));
    }
}
