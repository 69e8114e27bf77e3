//! VM Factory composition (spec §4.5): a VM whose guest script can
//! provision and shut down child VMs through `System.vms`, each mounted
//! independently once the RPC adapter exposes it (spec §9's resolution of
//! "factory mount vs. child mounts": the factory's own mount advertises
//! only the factory's exports; every provisioned child is mounted
//! separately at `/<childId>`).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mlua::Lua;
use parking_lot::Mutex;

use super::Vm;
use crate::error::CoreResult;
use crate::ledger::AppendOnlyLog;

/// The live set of VMs a factory has provisioned, keyed by the id handed
/// back from `provisionVM`. Shared between the factory's `System.vms`
/// bindings and whatever mounts children onto the RPC boundary.
#[derive(Default)]
pub struct Registry {
    children: Mutex<HashMap<String, Arc<Vm>>>,
    next_id: AtomicU64,
    /// `maxVMs` (spec §4.5); `0` means unbounded.
    max_children: usize,
}

impl Registry {
    pub fn new() -> Arc<Registry> {
        Arc::new(Registry::default())
    }

    pub fn with_max_children(max_children: usize) -> Arc<Registry> {
        Arc::new(Registry {
            max_children,
            ..Registry::default()
        })
    }

    pub fn get(&self, id: &str) -> Option<Arc<Vm>> {
        self.children.lock().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.children.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.children.lock().len()
    }

    fn at_capacity(&self) -> bool {
        self.max_children != 0 && self.children.lock().len() >= self.max_children
    }

    fn insert(&self, id: String, vm: Arc<Vm>) {
        self.children.lock().insert(id, vm);
    }

    fn remove(&self, id: &str) -> Option<Arc<Vm>> {
        self.children.lock().remove(id)
    }

    fn fresh_id(&self) -> String {
        format!("vm-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// Deploys a factory VM at `dir`: an ordinary [`Vm`] whose sandbox also
/// gets a `System.vms` table bound to a fresh [`Registry`] capped at
/// `max_children` (`0` for unbounded), backed by child deployments rooted
/// at `dir/children/<id>`.
pub fn deploy_factory(
    dir: PathBuf,
    title: String,
    code: String,
    max_children: usize,
) -> CoreResult<(Arc<Vm>, Arc<Registry>)> {
    let registry = Registry::with_max_children(max_children);
    let children_dir = dir.join("children");
    let registry_for_closure = registry.clone();

    let vm = Vm::deploy_with_extras(dir, title, code, move |lua| {
        let vms = install_vms_namespace(lua, children_dir, registry_for_closure)?;
        Ok(vec![("vms".to_string(), vms)])
    })?;

    Ok((vm, registry))
}

/// Reconstructs a factory VM from its call log (spec scenario S6): same
/// shape as [`deploy_factory`], but driven by [`crate::replay`] instead of
/// a literal `code` string, so a factory's own `provisionVM` calls replay
/// against a fresh `System.vms` table rather than failing for want of one.
pub async fn replay_factory(
    log: &dyn AppendOnlyLog,
    max_children: usize,
    dir: PathBuf,
) -> CoreResult<(Arc<Vm>, Arc<Registry>)> {
    let registry = Registry::with_max_children(max_children);
    let children_dir = dir.join("children");
    let registry_for_closure = registry.clone();

    let vm = crate::replay::from_call_log_with_extras(
        log,
        crate::replay::ReplayAssertions::default(),
        dir,
        move |lua| {
            let vms = install_vms_namespace(lua, children_dir, registry_for_closure)?;
            Ok(vec![("vms".to_string(), vms)])
        },
    )
    .await?;

    Ok((vm, registry))
}

/// Builds the `System.vms` table for a factory VM (spec §4.5):
/// `provisionVM(title, code)` deploys a child and returns a handle
/// `{ id, callLogUrl, filesArchiveUrl }`; `shutdownVM(id)` drops it from
/// the registry and closes it in the background.
fn install_vms_namespace(
    lua: &Lua,
    children_dir: PathBuf,
    registry: Arc<Registry>,
) -> mlua::Result<mlua::Table> {
    let vms = lua.create_table()?;

    let provision_dir = children_dir;
    let provision_registry = registry.clone();
    vms.set(
        "provisionVM",
        lua.create_function(move |lua, (title, code): (String, String)| {
            if code.is_empty() {
                return Err(mlua::Error::RuntimeError(
                    "provisionVM: code must be a non-empty string".to_string(),
                ));
            }
            if provision_registry.at_capacity() {
                return Err(mlua::Error::RuntimeError(
                    "provisionVM: factory is at its configured maxVMs".to_string(),
                ));
            }

            let id = provision_registry.fresh_id();
            let child = Vm::deploy(provision_dir.join(&id), title, code)
                .map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;
            let handle = lua.create_table()?;
            handle.set("id", id.clone())?;
            handle.set("callLogUrl", child.log().url())?;
            handle.set("filesArchiveUrl", child.archive().url())?;
            provision_registry.insert(id, child);
            Ok(handle)
        })?,
    )?;

    let shutdown_registry = registry;
    vms.set(
        "shutdownVM",
        lua.create_function(move |_, id: String| {
            match shutdown_registry.remove(&id) {
                Some(child) => {
                    // `System.vms` calls are synchronous Lua callbacks;
                    // closing a child crosses into its own worker task, so
                    // it's handed to the ambient runtime to finish in the
                    // background rather than awaited here.
                    tokio::spawn(async move { child.close().await });
                    Ok(())
                }
                None => Err(mlua::Error::RuntimeError(format!(
                    "shutdownVM: no such vm {id}"
                ))),
            }
        })?,
    )?;

    Ok(vms)
}
