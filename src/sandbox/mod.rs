//! The Guest Sandbox (spec §4.3): an isolated evaluation context for the
//! guest script, with a fixed, curated global surface.
//!
//! The teacher's original "guest" was the host process itself; the
//! auditing protocol this crate implements needs a true embedded
//! interpreter so the host can run untrusted-but-cooperative scripts.
//! `mlua` (already the pack's choice for guest scripting in
//! `vectordotdev-vector`) provides that: a synchronous, embeddable Lua
//! interpreter with a mature Rust binding.

mod system;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;

use mlua::{Function, Lua, Table};
use parking_lot::Mutex;

use crate::archive::VersionedArchive;
use crate::error::{CoreError, CoreResult};

pub use system::{install_test_namespace, CallerSlot};

/// An isolated evaluation context for one guest script.
///
/// `System.<namespace>` is installed before the script is loaded; after
/// loading, the guest's `exports` table is captured so [`Sandbox::call`]
/// can look callables up by name without re-touching Lua globals. Any
/// value the guest assigns onto `System` itself is never read back by the
/// host — the sandbox only ever reads from the `exports` table it set up
/// itself.
pub struct Sandbox {
    lua: Lua,
    caller: CallerSlot,
    exports: Mutex<HashMap<String, Function>>,
}

impl Sandbox {
    /// Builds a sandbox and installs the curated global surface, but does
    /// not yet evaluate a script.
    ///
    /// `build_extras` receives the sandbox's own `Lua` so it can construct
    /// native-function tables bound to it — a factory's `System.vms`
    /// being the motivating case, since those tables can't be built in a
    /// different interpreter and handed in.
    pub fn new(
        archive: Arc<dyn VersionedArchive>,
        build_extras: impl FnOnce(&Lua) -> mlua::Result<Vec<(String, Table)>>,
    ) -> CoreResult<Self> {
        let lua = Lua::new();
        let caller: CallerSlot = Arc::new(Mutex::new(None));

        let exports_table = lua
            .create_table()
            .map_err(|e| CoreError::ScriptEvaluation(e.to_string()))?;
        lua.globals()
            .set("exports", exports_table)
            .map_err(|e| CoreError::ScriptEvaluation(e.to_string()))?;

        let extras = build_extras(&lua).map_err(|e| CoreError::ScriptEvaluation(e.to_string()))?;
        system::install(&lua, caller.clone(), archive, extras)
            .map_err(|e| CoreError::ScriptEvaluation(e.to_string()))?;

        Ok(Sandbox {
            lua,
            caller,
            exports: Mutex::new(HashMap::new()),
        })
    }

    /// Evaluates `code` once, then captures the guest's exported mapping
    /// of `methodName -> callable`. Non-callable exports are silently
    /// ignored, matching spec §4.3's "non-callable exports are ignored
    /// for RPC purposes".
    pub fn evaluate(&self, code: &str) -> CoreResult<()> {
        self.lua
            .load(code)
            .set_name("guest")
            .exec()
            .map_err(|e| CoreError::ScriptEvaluation(e.to_string()))?;

        let exports_table: Table = self
            .lua
            .globals()
            .get("exports")
            .map_err(|e| CoreError::ScriptEvaluation(e.to_string()))?;

        let mut exports = self.exports.lock();
        for pair in exports_table.pairs::<String, mlua::Value>() {
            let (name, value) = pair.map_err(|e| CoreError::ScriptEvaluation(e.to_string()))?;
            if let mlua::Value::Function(f) = value {
                exports.insert(name, f);
            }
        }
        Ok(())
    }

    /// The names of every callable export, for the RPC handshake and
    /// blacklist filtering (spec §4.8).
    pub fn export_names(&self) -> Vec<String> {
        self.exports.lock().keys().cloned().collect()
    }

    pub fn has_export(&self, name: &str) -> bool {
        self.exports.lock().contains_key(name)
    }

    /// Invokes a guest export under the given caller identity, returning
    /// its JSON-encoded result.
    ///
    /// Sets the caller slot before the call and clears it afterward
    /// (spec §3's "cleared when no call is active"); because the VM
    /// serializes calls (spec §4.4 point 1), there is no concurrent call
    /// that could observe a stale or half-cleared slot.
    pub fn call(
        &self,
        method_name: &str,
        args: Vec<serde_json::Value>,
        user_id: Option<String>,
    ) -> CoreResult<Option<serde_json::Value>> {
        let function = {
            let exports = self.exports.lock();
            exports
                .get(method_name)
                .cloned()
                .ok_or_else(|| CoreError::MethodNotSupported(method_name.to_string()))?
        };

        *self.caller.lock() = user_id;
        let result = self.invoke(&function, args);
        *self.caller.lock() = None;
        result
    }

    fn invoke(
        &self,
        function: &Function,
        args: Vec<serde_json::Value>,
    ) -> CoreResult<Option<serde_json::Value>> {
        use mlua::LuaSerdeExt;

        let mut lua_args = Vec::with_capacity(args.len());
        for arg in args {
            lua_args.push(
                self.lua
                    .to_value(&arg)
                    .map_err(|e| CoreError::Guest(e.to_string()))?,
            );
        }

        let result: mlua::Value = function
            .call(mlua::MultiValue::from_vec(lua_args))
            .map_err(|e| CoreError::Guest(guest_message(e)))?;

        if matches!(result, mlua::Value::Nil) {
            return Ok(None);
        }
        let json: serde_json::Value = self
            .lua
            .from_value(result)
            .map_err(|e| CoreError::Guest(e.to_string()))?;
        Ok(Some(json))
    }
}

/// Strips mlua's `runtime error: ` framing so the recorded guest error
/// message matches what the guest script actually raised.
fn guest_message(e: mlua::Error) -> String {
    match &e {
        mlua::Error::RuntimeError(msg) => msg.clone(),
        mlua::Error::CallbackError { cause, .. } => guest_message(cause.as_ref().clone()),
        other => other.to_string(),
    }
}
