use tempfile::tempdir;

use super::*;
use crate::vm::Vm;

#[tokio::test]
async fn mount_and_unmount_track_vms_by_path() {
    let dir = tempdir().unwrap();
    let vm = Vm::deploy(
        dir.path().to_path_buf(),
        "vm".into(),
        "exports.f = function() return 1 end".into(),
    )
    .unwrap();

    let adapter = RpcAdapter::new();
    adapter.mount("greeter", vm.clone());
    assert_eq!(adapter.mounted_paths(), vec!["greeter".to_string()]);
    assert!(adapter.get("greeter").is_some());

    let unmounted = adapter.unmount("greeter").unwrap();
    assert!(Arc::ptr_eq(&unmounted, &vm));
    assert!(adapter.get("greeter").is_none());
}

#[tokio::test]
async fn close_drains_every_mount_and_closes_its_vm() {
    let dir = tempdir().unwrap();
    let vm = Vm::deploy(
        dir.path().to_path_buf(),
        "vm".into(),
        "exports.f = function() return 1 end".into(),
    )
    .unwrap();

    let adapter = RpcAdapter::new();
    adapter.mount("vm", vm.clone());
    adapter.close().await;

    assert!(adapter.mounted_paths().is_empty());
    let err = vm.execute_call("f", vec![], None).await.unwrap_err();
    assert!(matches!(err, crate::error::CoreError::Closed));
}
