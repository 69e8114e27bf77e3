use super::*;
use tempfile::tempdir;

#[test]
fn write_then_read_roundtrips() {
    let dir = tempdir().unwrap();
    let archive = LocalArchive::create(dir.path(), "t").unwrap();
    assert_eq!(archive.version(), 1);

    let v1 = archive
        .write_file("/file", serde_json::json!("foo"), Encoding::Utf8)
        .unwrap();
    assert_eq!(v1, 2);

    let read = archive.read_file("/file", Encoding::Utf8).unwrap();
    assert_eq!(read, serde_json::json!("foo"));
}

#[test]
fn version_increments_once_per_mutation() {
    let dir = tempdir().unwrap();
    let archive = LocalArchive::create(dir.path(), "t").unwrap();

    archive
        .write_file("/a", serde_json::json!("1"), Encoding::Utf8)
        .unwrap();
    archive
        .write_file("/a", serde_json::json!("2"), Encoding::Utf8)
        .unwrap();
    archive.mkdir("/dir").unwrap();

    assert_eq!(archive.version(), 4);
}

#[test]
fn reads_do_not_advance_version() {
    let dir = tempdir().unwrap();
    let archive = LocalArchive::create(dir.path(), "t").unwrap();
    archive
        .write_file("/a", serde_json::json!("1"), Encoding::Utf8)
        .unwrap();
    let version_before = archive.version();

    archive.read_file("/a", Encoding::Utf8).unwrap();
    archive.stat("/a").unwrap();
    archive.readdir("/").unwrap();

    assert_eq!(archive.version(), version_before);
}

#[test]
fn rejects_escaping_paths() {
    let dir = tempdir().unwrap();
    let archive = LocalArchive::create(dir.path(), "t").unwrap();
    let err = archive
        .write_file("/../escape", serde_json::json!("x"), Encoding::Utf8)
        .unwrap_err();
    assert!(matches!(err, CoreError::PathEscape(_)));
}

#[test]
fn binary_encoding_roundtrips_bytes() {
    let dir = tempdir().unwrap();
    let archive = LocalArchive::create(dir.path(), "t").unwrap();
    let bytes = vec![0u8, 1, 2, 255];
    let payload = serde_json::Value::Array(bytes.iter().map(|b| serde_json::json!(b)).collect());
    archive
        .write_file("/blob", payload.clone(), Encoding::Binary)
        .unwrap();
    let read = archive.read_file("/blob", Encoding::Binary).unwrap();
    assert_eq!(read, payload);
}
