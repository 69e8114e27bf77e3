use std::sync::Arc;

use tempfile::tempdir;

use super::*;
use crate::archive::LocalArchive;

fn sandbox() -> (Sandbox, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let archive = Arc::new(LocalArchive::create(dir.path(), "test".into()).unwrap());
    (Sandbox::new(archive, |_| Ok(Vec::new())).unwrap(), dir)
}

#[test]
fn exported_function_is_callable_and_returns_json() {
    let (sandbox, _dir) = sandbox();
    sandbox
        .evaluate("exports.add = function(a, b) return a + b end")
        .unwrap();
    assert!(sandbox.has_export("add"));
    let result = sandbox
        .call("add", vec![serde_json::json!(2), serde_json::json!(3)], None)
        .unwrap();
    assert_eq!(result, Some(serde_json::json!(5.0)));
}

#[test]
fn non_callable_exports_are_ignored() {
    let (sandbox, _dir) = sandbox();
    sandbox
        .evaluate("exports.constant = 42\nexports.fn = function() return 1 end")
        .unwrap();
    assert!(!sandbox.has_export("constant"));
    assert!(sandbox.has_export("fn"));
}

#[test]
fn calling_unknown_method_is_method_not_supported() {
    let (sandbox, _dir) = sandbox();
    sandbox.evaluate("exports.f = function() return 1 end").unwrap();
    let err = sandbox.call("missing", vec![], None).unwrap_err();
    assert!(matches!(err, CoreError::MethodNotSupported(name) if name == "missing"));
}

#[test]
fn caller_id_is_visible_during_the_call_and_cleared_after() {
    let (sandbox, _dir) = sandbox();
    sandbox
        .evaluate("exports.whoami = function() return System.caller.id end")
        .unwrap();
    let result = sandbox.call("whoami", vec![], Some("alice".into())).unwrap();
    assert_eq!(result, Some(serde_json::json!("alice")));
    assert!(sandbox.caller.lock().is_none());
}

#[test]
fn guest_error_surfaces_with_its_message() {
    let (sandbox, _dir) = sandbox();
    sandbox
        .evaluate("exports.boom = function() error('kaboom') end")
        .unwrap();
    let err = sandbox.call("boom", vec![], None).unwrap_err();
    match err {
        CoreError::Guest(msg) => assert!(msg.contains("kaboom")),
        other => panic!("expected guest error, got {other:?}"),
    }
}

#[test]
fn files_namespace_round_trips_through_the_archive() {
    let (sandbox, _dir) = sandbox();
    sandbox
        .evaluate(
            r#"
            exports.roundtrip = function()
                System.files.writeFile("/greeting.txt", "hello")
                return System.files.readFile("/greeting.txt")
            end
            "#,
        )
        .unwrap();
    let result = sandbox.call("roundtrip", vec![], None).unwrap();
    assert_eq!(result, Some(serde_json::json!("hello")));
}
