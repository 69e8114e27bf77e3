//! Builds the curated `System.*` global surface a guest script sees.
//!
//! Every namespace here is installed fresh for each [`super::Sandbox`];
//! nothing installed is shared mutable Lua state across sandboxes, so two
//! VMs never see each other's `System` table.

use std::sync::Arc;

use mlua::{Lua, LuaSerdeExt, MultiValue, Table, Value};
use parking_lot::Mutex;

use crate::archive::{Encoding, VersionedArchive};
use crate::error::CoreError;

/// The caller-context slot (spec §3, §4.4 point 3): a single scalar owned
/// by the VM, read through a guest-facing accessor. Because the VM
/// serializes calls, a plain `Mutex` is sufficient — there is never
/// contention between two calls observing or mutating it concurrently.
pub type CallerSlot = Arc<Mutex<Option<String>>>;

fn to_lua_err(e: CoreError) -> mlua::Error {
    mlua::Error::RuntimeError(e.to_string())
}

fn encoding_from_opts(opts: Option<Table>) -> mlua::Result<Encoding> {
    let Some(opts) = opts else {
        return Ok(Encoding::Utf8);
    };
    match opts.get::<Option<String>>("encoding")? {
        Some(s) => match s.as_str() {
            "utf-8" | "utf8" => Ok(Encoding::Utf8),
            "binary" => Ok(Encoding::Binary),
            "json" => Ok(Encoding::Json),
            other => Err(mlua::Error::RuntimeError(format!(
                "unknown encoding: {other}"
            ))),
        },
        None => Ok(Encoding::Utf8),
    }
}

/// Installs `System.files`, backed by `archive`.
fn install_files(lua: &Lua, system: &Table, archive: Arc<dyn VersionedArchive>) -> mlua::Result<()> {
    let files = lua.create_table()?;

    let a = archive.clone();
    files.set(
        "getInfo",
        lua.create_function(move |lua, ()| {
            let info = a.get_info().map_err(to_lua_err)?;
            lua.to_value(&info)
        })?,
    )?;

    let a = archive.clone();
    files.set(
        "stat",
        lua.create_function(move |lua, path: String| {
            let stat = a.stat(&path).map_err(to_lua_err)?;
            lua.to_value(&stat)
        })?,
    )?;

    let a = archive.clone();
    files.set(
        "readFile",
        lua.create_function(move |lua, (path, opts): (String, Option<Table>)| {
            let encoding = encoding_from_opts(opts)?;
            let value = a.read_file(&path, encoding).map_err(to_lua_err)?;
            lua.to_value(&value)
        })?,
    )?;

    let a = archive.clone();
    files.set(
        "readdir",
        lua.create_function(move |lua, (path, _opts): (String, Option<Table>)| {
            let entries = a.readdir(&path).map_err(to_lua_err)?;
            lua.to_value(&entries)
        })?,
    )?;

    let a = archive.clone();
    files.set(
        "history",
        lua.create_function(move |lua, _opts: Option<Table>| {
            let history = a.history().map_err(to_lua_err)?;
            lua.to_value(&history)
        })?,
    )?;

    let a = archive.clone();
    files.set(
        "writeFile",
        lua.create_function(move |lua, (path, data, opts): (String, Value, Option<Table>)| {
            let encoding = encoding_from_opts(opts)?;
            let json: serde_json::Value = lua.from_value(data)?;
            a.write_file(&path, json, encoding).map_err(to_lua_err)
        })?,
    )?;

    let a = archive.clone();
    files.set(
        "mkdir",
        lua.create_function(move |_, path: String| a.mkdir(&path).map_err(to_lua_err))?,
    )?;

    let a = archive.clone();
    files.set(
        "unlink",
        lua.create_function(move |_, path: String| a.unlink(&path).map_err(to_lua_err))?,
    )?;

    let a = archive;
    files.set(
        "rmdir",
        lua.create_function(move |_, (path, opts): (String, Option<Table>)| {
            let recursive = opts
                .map(|t| t.get::<Option<bool>>("recursive"))
                .transpose()?
                .flatten()
                .unwrap_or(false);
            a.rmdir(&path, recursive).map_err(to_lua_err)
        })?,
    )?;

    system.set("files", files)
}

/// Installs `System.caller`, a table whose `id` field is resolved through
/// a metatable `__index`, so every read reflects the *current* value of
/// `caller` even though the Lua table itself is never mutated.
fn install_caller(lua: &Lua, system: &Table, caller: CallerSlot) -> mlua::Result<()> {
    let proxy = lua.create_table()?;
    let metatable = lua.create_table()?;
    metatable.set(
        "__index",
        lua.create_function(move |lua, (_t, key): (Table, String)| {
            if key == "id" {
                match &*caller.lock() {
                    Some(id) => Ok(Value::String(lua.create_string(id)?)),
                    None => Ok(Value::Nil),
                }
            } else {
                Ok(Value::Nil)
            }
        })?,
    )?;
    proxy.set_metatable(Some(metatable));
    system.set("caller", proxy)
}

/// Installs `console.log/info/warn/error`, routed to `tracing`.
fn install_console(lua: &Lua) -> mlua::Result<()> {
    let console = lua.create_table()?;
    console.set(
        "log",
        lua.create_function(|_, args: MultiValue| {
            tracing::info!(target: "guest.console", "{}", format_args(&args));
            Ok(())
        })?,
    )?;
    console.set(
        "warn",
        lua.create_function(|_, args: MultiValue| {
            tracing::warn!(target: "guest.console", "{}", format_args(&args));
            Ok(())
        })?,
    )?;
    console.set(
        "error",
        lua.create_function(|_, args: MultiValue| {
            tracing::error!(target: "guest.console", "{}", format_args(&args));
            Ok(())
        })?,
    )?;
    lua.globals().set("console", console)
}

fn format_args(args: &MultiValue) -> String {
    args.iter()
        .map(|v| match v {
            Value::String(s) => s.to_str().map(|s| s.to_string()).unwrap_or_default(),
            other => format!("{other:?}"),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Installs a minimal `Buffer` constructor and synchronous timer stand-ins.
///
/// The core has no event loop of its own (spec §5 notes the host owns the
/// process and applies no timeouts to guest execution), so `setTimeout`
/// invokes its callback inline rather than after a real delay — sufficient
/// for the auditing invariants, which only care that a call's method ran
/// to completion before the ledger records it.
fn install_runtime_primitives(lua: &Lua) -> mlua::Result<()> {
    let buffer_ctor = lua.create_table()?;
    buffer_ctor.set(
        "from",
        lua.create_function(|lua, value: Value| {
            let bytes: Vec<u8> = match value {
                Value::String(s) => s.as_bytes().to_vec(),
                Value::Table(t) => {
                    let mut bytes = Vec::new();
                    for pair in t.sequence_values::<u8>() {
                        bytes.push(pair?);
                    }
                    bytes
                }
                other => {
                    return Err(mlua::Error::RuntimeError(format!(
                        "Buffer.from expects a string or byte array, got {}",
                        other.type_name()
                    )));
                }
            };
            let table = lua.create_table()?;
            for (i, b) in bytes.iter().enumerate() {
                table.set(i + 1, *b)?;
            }
            Ok(table)
        })?,
    )?;
    lua.globals().set("Buffer", buffer_ctor)?;

    lua.globals().set(
        "setTimeout",
        lua.create_function(|_, (callback, _delay_ms): (mlua::Function, Option<i64>)| {
            callback.call::<()>(())?;
            Ok(0i64)
        })?,
    )?;
    lua.globals().set(
        "clearTimeout",
        lua.create_function(|_, _handle: Value| Ok(()))?,
    )?;
    Ok(())
}

/// Installs the whole curated `System` global plus the ambient
/// `console`/`Buffer`/timer surface. `extras` are arbitrary host-installed
/// `System.<name>` namespaces — a factory VM's `vms` table (spec §4.5), or
/// the `test` namespace used to demonstrate nondeterminism detection (spec
/// §4.3) — built by [`super::Sandbox::new`]'s caller against the same
/// `Lua` these tables are installed into.
pub fn install(
    lua: &Lua,
    caller: CallerSlot,
    archive: Arc<dyn VersionedArchive>,
    extras: Vec<(String, Table)>,
) -> mlua::Result<()> {
    let system = lua.create_table()?;
    install_files(lua, &system, archive)?;
    install_caller(lua, &system, caller)?;
    for (name, table) in extras {
        system.set(name, table)?;
    }
    lua.globals().set("System", system)?;
    install_console(lua)?;
    install_runtime_primitives(lua)?;
    Ok(())
}

/// Builds the `System.test` namespace: deterministic-*looking* but
/// actually nondeterministic operations, used by the test suite to
/// demonstrate that replay-and-compare catches a guest that isn't
/// actually pure (spec §4.3, scenario S4).
pub fn install_test_namespace(lua: &Lua) -> mlua::Result<Table> {
    let test = lua.create_table()?;
    test.set(
        "random",
        lua.create_function(|_, ()| -> mlua::Result<f64> {
            use rand::Rng;
            Ok(rand::thread_rng().gen::<f64>())
        })?,
    )?;
    test.set(
        "sleepMs",
        lua.create_function(|_, ms: u64| {
            std::thread::sleep(std::time::Duration::from_millis(ms));
            Ok(())
        })?,
    )?;
    Ok(test)
}
