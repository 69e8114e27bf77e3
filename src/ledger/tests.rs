use super::*;
use tempfile::tempdir;

#[test]
fn create_seeds_sequence_zero_with_init() {
    let dir = tempdir().unwrap();
    let log = LocalLog::create(dir.path(), "exports.f = () => 1", "archive://abc").unwrap();
    assert_eq!(log.length(), 1);
    let entry = log.get(0, GetOptions::default()).unwrap();
    match entry {
        LedgerEntry::Init {
            code,
            files_archive_url,
        } => {
            assert_eq!(code, "exports.f = () => 1");
            assert_eq!(files_archive_url, "archive://abc");
        }
        _ => panic!("expected init"),
    }
}

#[test]
fn create_twice_in_same_dir_fails() {
    let dir = tempdir().unwrap();
    LocalLog::create(dir.path(), "code", "archive://x").unwrap();
    let err = LocalLog::create(dir.path(), "code", "archive://x").unwrap_err();
    assert!(matches!(err, CoreError::Config(_)));
}

#[test]
fn open_reads_back_appended_calls() {
    let dir = tempdir().unwrap();
    {
        let log = LocalLog::create(dir.path(), "code", "archive://x").unwrap();
        log.append_call(
            CallRequest {
                method_name: "f".into(),
                args: vec![],
                user_id: None,
            },
            CallOutcome {
                files_version: 1,
                res: Some(serde_json::json!(1)),
                err: None,
            },
        )
        .unwrap();
    }

    let reopened = LocalLog::open(dir.path(), "log://whatever".into()).unwrap();
    assert_eq!(reopened.length(), 2);
    let second = reopened.get(1, GetOptions::default()).unwrap();
    match second {
        LedgerEntry::Call { call, result } => {
            assert_eq!(call.method_name, "f");
            assert_eq!(result.files_version, 1);
            assert_eq!(result.res, Some(serde_json::json!(1)));
        }
        _ => panic!("expected call"),
    }
}

#[test]
fn open_rejects_log_without_init_at_zero() {
    let dir = tempdir().unwrap();
    std::fs::write(
        dir.path().join("entries.jsonl"),
        "{\"type\":\"call\",\"call\":{\"methodName\":\"f\",\"args\":[]},\"result\":{\"filesVersion\":1}}\n",
    )
    .unwrap();
    let err = LocalLog::open(dir.path(), "log://x".into()).unwrap_err();
    assert!(matches!(err, CoreError::MalformedLog(_)));
}

#[test]
fn list_honors_half_open_range() {
    let dir = tempdir().unwrap();
    let log = LocalLog::create(dir.path(), "code", "archive://x").unwrap();
    for i in 0..3 {
        log.append_call(
            CallRequest {
                method_name: "f".into(),
                args: vec![serde_json::json!(i)],
                user_id: None,
            },
            CallOutcome {
                files_version: 1,
                res: None,
                err: None,
            },
        )
        .unwrap();
    }
    assert_eq!(log.list(0, None).unwrap().len(), 4);
    assert_eq!(log.list(1, Some(3)).unwrap().len(), 2);
}
