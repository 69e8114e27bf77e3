//! The execution kernel (spec §4.4): binds a [`Sandbox`] to a
//! [`VersionedArchive`] and an [`AppendOnlyLog`], and guarantees that calls
//! run one at a time and are logged in the order they run.
//!
//! A deployed VM owns a single background task — the *worker* — which is
//! the only place `Sandbox::call` is ever invoked. Every other task talks
//! to the VM exclusively through [`Vm::execute_call`], which enqueues onto
//! [`queue::CallQueue`] and awaits a reply; this is what makes "no second
//! call begins until the current one returns" true by construction rather
//! than by a flag someone has to remember to check.

pub mod factory;
mod meta;
pub mod queue;

#[cfg(test)]
mod tests;

use std::path::PathBuf;
use std::sync::Arc;

use mlua::Table;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::archive::{LocalArchive, VersionedArchive};
use crate::error::{CoreError, CoreResult};
use crate::ledger::{
    AppendOnlyLog, CallOutcome, CallRequest, GetOptions, GuestErrorRecord, LedgerEntry, LocalLog,
};
use crate::sandbox::Sandbox;
use meta::VmMeta;
use queue::{CallQueue, QueuedCall};

/// Default bound on queued-but-not-yet-executing calls (spec §4.8).
pub const DEFAULT_Q_MAX: usize = 1_000;

/// A deployed VM's lifecycle state.
///
/// The spec's state machine also names `EVALUATED`/`EXECUTING` as
/// sub-states reached while a call is in flight; they're collapsed here
/// because [`queue::CallQueue`] already enforces the one-call-at-a-time
/// invariant those states exist to describe — there is no observable
/// difference between "evaluated, idle" and "evaluated, mid-call" from
/// outside the worker task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Constructed,
    Deployed,
    Closed,
}

/// The execution kernel. Construct one with [`Vm::deploy`] (fresh) or
/// [`Vm::open`] (an existing deployment directory); both hand back an
/// `Arc<Vm>` since the worker task holds a handle back into shared state.
pub struct Vm {
    archive: Arc<dyn VersionedArchive>,
    log: Arc<dyn AppendOnlyLog>,
    queue: Arc<CallQueue>,
    state: Mutex<VmState>,
    worker: Mutex<Option<JoinHandle<()>>>,
    code: String,
    dir: PathBuf,
    /// Snapshot of the guest's callable exports, taken once right after
    /// `evaluate` and before the sandbox moves into the worker task. The
    /// guest never re-populates `exports` after the initial load, so this
    /// never goes stale — it's what lets the RPC adapter answer a
    /// handshake without asking the worker.
    methods: Vec<String>,
}

impl Vm {
    /// Deploys a brand new VM under `dir`: evaluates `code` in a fresh
    /// sandbox, creates the files archive and call log, and writes the
    /// `meta.json` sidecar the two must agree with on reopen.
    ///
    /// Construction itself is synchronous local I/O; the only things this
    /// crate does across an `.await` are [`Self::execute_call`] and
    /// [`Self::close`], which cross into the worker task. That's what lets
    /// [`super::factory`]'s `provisionVM` binding — a synchronous Lua
    /// callback — deploy a child VM without needing an async Lua runtime.
    pub fn deploy(dir: PathBuf, title: String, code: String) -> CoreResult<Arc<Vm>> {
        Self::deploy_with_extras(dir, title, code, |_| Ok(Vec::new()))
    }

    /// As [`Self::deploy`], but lets a caller (namely [`super::factory`])
    /// install extra `System.*` namespaces before the guest script runs.
    pub fn deploy_with_extras(
        dir: PathBuf,
        title: String,
        code: String,
        build_extras: impl FnOnce(&mlua::Lua) -> mlua::Result<Vec<(String, Table)>>,
    ) -> CoreResult<Arc<Vm>> {
        Self::deploy_with_extras_and_capacity(dir, title, code, build_extras, DEFAULT_Q_MAX)
    }

    /// As [`Self::deploy_with_extras`], but lets a caller override the call
    /// queue's bound instead of taking [`DEFAULT_Q_MAX`] (spec §6's
    /// configurable `Q_MAX`).
    pub fn deploy_with_extras_and_capacity(
        dir: PathBuf,
        title: String,
        code: String,
        build_extras: impl FnOnce(&mlua::Lua) -> mlua::Result<Vec<(String, Table)>>,
        queue_capacity: usize,
    ) -> CoreResult<Arc<Vm>> {
        let files_dir = dir.join("files");
        let archive: Arc<dyn VersionedArchive> =
            Arc::new(LocalArchive::create(&files_dir, &title)?);

        let sandbox = Sandbox::new(archive.clone(), build_extras)?;
        sandbox.evaluate(&code)?;

        let log_dir = dir.join("log");
        let log: Arc<dyn AppendOnlyLog> =
            Arc::new(LocalLog::create(&log_dir, &code, &archive.url())?);

        VmMeta::write(
            &dir,
            &VmMeta {
                title,
                log_url: log.url(),
                files_archive_url: archive.url(),
            },
        )?;

        // spec §4.4's "if `init` is exported, enqueue a call to it" — run
        // directly against the sandbox rather than through the worker task,
        // since `deploy` is synchronous and this must complete (and be
        // logged as sequence 1) before `deploy` returns control to the
        // caller (spec §12 open question 1: `ready` only fires after `init`
        // has finished).
        if sandbox.has_export("init") {
            let _ = execute_and_log(
                &sandbox,
                &log,
                &archive,
                CallRequest {
                    method_name: "init".to_string(),
                    args: Vec::new(),
                    user_id: None,
                },
            );
        }

        Ok(Self::spawn(dir, code, archive, log, sandbox, queue_capacity))
    }

    /// Reopens a previously deployed VM: re-evaluates the code recorded at
    /// sequence 0 of its call log against a fresh sandbox bound to its
    /// existing files archive. Rejects with
    /// [`CoreError::AssertionMismatch`] if `meta.json` disagrees with
    /// either the log or the archive about which URL belongs to it (spec
    /// §12 open question 2).
    pub fn open(dir: PathBuf) -> CoreResult<Arc<Vm>> {
        Self::open_with_capacity(dir, DEFAULT_Q_MAX)
    }

    /// As [`Self::open`], but lets a caller override the call queue's
    /// bound instead of taking [`DEFAULT_Q_MAX`].
    pub fn open_with_capacity(dir: PathBuf, queue_capacity: usize) -> CoreResult<Arc<Vm>> {
        let meta = VmMeta::read(&dir)?;

        let log_dir = dir.join("log");
        let log: Arc<dyn AppendOnlyLog> = Arc::new(LocalLog::open(&log_dir, meta.log_url.clone())?);
        if log.url() != meta.log_url {
            return Err(CoreError::AssertionMismatch {
                expected: meta.log_url,
                found: log.url(),
            });
        }

        let code = match log.get(0, GetOptions::default())? {
            LedgerEntry::Init {
                code,
                files_archive_url,
            } => {
                if files_archive_url != meta.files_archive_url {
                    return Err(CoreError::AssertionMismatch {
                        expected: meta.files_archive_url,
                        found: files_archive_url,
                    });
                }
                code
            }
            _ => return Err(CoreError::MalformedLog("sequence 0 is not init".into())),
        };

        // The on-disk files are the source of truth for content, but the
        // archive's in-memory `version`/`history` bookkeeping is not
        // persisted across a process restart; reconstruct the baseline
        // from the log's last recorded `filesVersion` so a reopened VM's
        // next mutation continues the same monotonic sequence instead of
        // resetting to 1 (spec invariant 2).
        let baseline_version = log
            .list(1, None)?
            .iter()
            .rev()
            .find_map(|entry| match entry {
                LedgerEntry::Call { result, .. } => Some(result.files_version),
                _ => None,
            })
            .unwrap_or(1);

        let files_dir = dir.join("files");
        let archive: Arc<dyn VersionedArchive> = Arc::new(LocalArchive::open(
            &files_dir,
            &meta.title,
            meta.files_archive_url.clone(),
            baseline_version,
        )?);
        if archive.url() != meta.files_archive_url {
            return Err(CoreError::AssertionMismatch {
                expected: meta.files_archive_url,
                found: archive.url(),
            });
        }

        let sandbox = Sandbox::new(archive.clone(), |_| Ok(Vec::new()))?;
        sandbox.evaluate(&code)?;

        Ok(Self::spawn(dir, code, archive, log, sandbox, queue_capacity))
    }

    fn spawn(
        dir: PathBuf,
        code: String,
        archive: Arc<dyn VersionedArchive>,
        log: Arc<dyn AppendOnlyLog>,
        sandbox: Sandbox,
        queue_capacity: usize,
    ) -> Arc<Vm> {
        let methods = sandbox.export_names();
        let queue = Arc::new(CallQueue::new(queue_capacity));

        let vm = Arc::new(Vm {
            archive: archive.clone(),
            log: log.clone(),
            queue: queue.clone(),
            state: Mutex::new(VmState::Deployed),
            worker: Mutex::new(None),
            code,
            dir,
            methods,
        });

        let handle = tokio::spawn(run_worker(sandbox, queue, log, archive));
        *vm.worker.lock() = Some(handle);
        vm
    }

    pub fn state(&self) -> VmState {
        *self.state.lock()
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    pub fn archive(&self) -> &Arc<dyn VersionedArchive> {
        &self.archive
    }

    pub fn log(&self) -> &Arc<dyn AppendOnlyLog> {
        &self.log
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// The guest's callable export names, as captured right after
    /// evaluation (spec §4.8's RPC handshake).
    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    /// Enqueues a call and waits for it to run. Every call that reaches
    /// the guest — success or guest error alike — is appended to the call
    /// log before this resolves; a call rejected before dispatch (unknown
    /// method, closed VM, full queue) is never logged, since the guest
    /// never ran.
    pub async fn execute_call(
        self: &Arc<Self>,
        method_name: impl Into<String>,
        args: Vec<serde_json::Value>,
        user_id: Option<String>,
    ) -> CoreResult<Option<serde_json::Value>> {
        if self.state() == VmState::Closed {
            return Err(CoreError::Closed);
        }

        let (tx, rx) = oneshot::channel();
        self.queue.enqueue(QueuedCall {
            request: CallRequest {
                method_name: method_name.into(),
                args,
                user_id,
            },
            respond_to: tx,
        })?;
        rx.await.map_err(|_| CoreError::Closed)?
    }

    /// Closes the VM: cancels every call still waiting in the queue with
    /// [`CoreError::Closed`], then waits for a call already in progress to
    /// finish before returning. Idempotent.
    pub async fn close(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state == VmState::Closed {
                return;
            }
            *state = VmState::Closed;
        }

        for call in self.queue.close() {
            let _ = call.respond_to.send(Err(CoreError::Closed));
        }

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Invokes `request` against `sandbox` and appends the outcome to `log`
/// whether the guest succeeded or threw (spec §4.4's "the append happens
/// whether the method succeeded or threw"). Shared by the worker loop and
/// by [`Vm::deploy_with_extras_and_capacity`]'s deploy-time `init` call,
/// which runs before the worker task exists.
fn execute_and_log(
    sandbox: &Sandbox,
    log: &Arc<dyn AppendOnlyLog>,
    archive: &Arc<dyn VersionedArchive>,
    request: CallRequest,
) -> CoreResult<Option<serde_json::Value>> {
    let logged_request = request.clone();
    let outcome = sandbox.call(&request.method_name, request.args, request.user_id);
    let files_version = archive.version();

    match outcome {
        Ok(value) => {
            let _ = log.append_call(
                logged_request,
                CallOutcome {
                    files_version,
                    res: value.clone(),
                    err: None,
                },
            );
            Ok(value)
        }
        Err(e) => {
            let _ = log.append_call(
                logged_request,
                CallOutcome {
                    files_version,
                    res: None,
                    err: Some(GuestErrorRecord {
                        message: e.to_string(),
                    }),
                },
            );
            Err(e)
        }
    }
}

/// The single task that ever touches the sandbox. Runs until
/// [`CallQueue::next`] returns `None`, i.e. until the VM is closed and
/// drained.
async fn run_worker(
    sandbox: Sandbox,
    queue: Arc<CallQueue>,
    log: Arc<dyn AppendOnlyLog>,
    archive: Arc<dyn VersionedArchive>,
) {
    while let Some(queued) = queue.next().await {
        let QueuedCall {
            request,
            respond_to,
        } = queued;

        if !sandbox.has_export(&request.method_name) {
            let _ = respond_to.send(Err(CoreError::MethodNotSupported(
                request.method_name.clone(),
            )));
            continue;
        }

        let result = execute_and_log(&sandbox, &log, &archive, request);
        let _ = respond_to.send(result);
    }
}
