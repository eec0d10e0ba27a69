//! Redirecting a project's storage through its connection holder.

use projectdb::prelude::*;
use projectdb::{NativeHandle, open_project};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS sampleblocks (blockid INTEGER PRIMARY KEY, samples BLOB);";

fn blocks(holder: &ConnectionHolder) -> i64 {
    holder
        .with_connection(|conn| {
            conn.query("SELECT count(*) FROM sampleblocks;", &[]).unwrap()[0]
                .get_as::<i64>(0)
                .unwrap()
        })
        .unwrap()
}

fn add_block(holder: &ConnectionHolder) {
    holder.with_connection(|conn| {
        conn.execute_batch(SCHEMA).unwrap();
        let mut scope = TransactionScope::begin(conn, "add").unwrap();
        conn.prepare_statement(
            StatementId::InsertSampleBlock,
            "INSERT INTO sampleblocks (samples) VALUES (?1);",
        )
        .unwrap()
        .execute(&[Value::Bytes(vec![1, 2, 3, 4])])
        .unwrap();
        scope.commit().unwrap();
    });
}

#[test]
fn open_project_wires_holder_and_project() {
    let dir = tempfile::tempdir().unwrap();
    let (project, holder) =
        open_project("song", dir.path().join("song.aup3"), ConnectionConfig::default(), || {}).unwrap();
    assert_eq!(project.name(), "song");
    assert!(Arc::ptr_eq(&holder, &ConnectionHolder::get(&project)));
    assert!(holder.is_open());
    add_block(&holder);
    assert_eq!(blocks(&holder), 1);
}

#[test]
fn redirect_to_backup_and_back() {
    let dir = tempfile::tempdir().unwrap();
    let project = Project::new("song");
    let holder = ConnectionHolder::get(&project);
    holder
        .open(dir.path().join("main.aup3"), ConnectionConfig::default(), || {})
        .unwrap();
    add_block(&holder);

    assert!(holder.save_connection());
    holder
        .open(dir.path().join("backup.aup3"), ConnectionConfig::default(), || {})
        .unwrap();
    add_block(&holder);
    add_block(&holder);
    assert_eq!(blocks(&holder), 2);

    assert!(holder.restore_connection());
    assert_eq!(blocks(&holder), 1);

    // The backup was closed on restore, so it reopens cleanly with its data.
    let mut backup = Connection::detached();
    assert_eq!(
        backup.open(dir.path().join("backup.aup3")).unwrap(),
        OpenStatus::Existing
    );
    assert_eq!(
        backup.query("SELECT count(*) FROM sampleblocks;", &[]).unwrap()[0]
            .get_as::<i64>(0)
            .unwrap(),
        2
    );
}

#[test]
fn save_as_moves_the_native_handle() {
    let dir = tempfile::tempdir().unwrap();
    let project = Project::new("song");
    let holder = ConnectionHolder::get(&project);
    holder
        .open(dir.path().join("untitled.aup3"), ConnectionConfig::default(), || {})
        .unwrap();
    add_block(&holder);

    let handle = NativeHandle::open(dir.path().join("saved.aup3"), 5_000).unwrap();
    let previous = holder
        .with_connection(|conn| {
            let old = conn.detach_native_handle();
            conn.assign_native_handle(handle).unwrap();
            old
        })
        .unwrap()
        .unwrap();
    assert!(previous.filename().unwrap().ends_with("untitled.aup3"));
    drop(previous);

    let path = holder
        .with_connection(|conn| conn.path().map(std::path::Path::to_path_buf))
        .flatten()
        .unwrap();
    assert!(path.ends_with("saved.aup3"));
    add_block(&holder);
    assert_eq!(blocks(&holder), 1);
    assert!(holder.close());
}

#[test]
fn close_runs_before_replacement_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let project = Project::new("song");
    let holder = ConnectionHolder::get(&project);
    holder
        .open(dir.path().join("a.aup3"), ConnectionConfig::default(), || {})
        .unwrap();
    add_block(&holder);
    let errors = holder.with_connection(|conn| conn.error_state()).unwrap();

    let mut next = Connection::new(&project, || {}).with_error_state(Arc::clone(&errors));
    next.open(dir.path().join("a.aup3")).unwrap();
    assert!(holder.replace(Some(next)));
    assert_eq!(blocks(&holder), 1);

    holder.with_connection(|conn| conn.set_error("shared record", None, None));
    assert_eq!(errors.message(), "shared record");
}

#[test]
fn failure_callbacks_wait_for_dispatch() {
    let project = Project::new("song");
    let fired = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let fired = Arc::clone(&fired);
        project.call_after(move || {
            fired.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert_eq!(project.pending_calls(), 3);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(project.dispatch_pending(), 3);
    assert_eq!(fired.load(Ordering::SeqCst), 3);
    assert_eq!(project.dispatch_pending(), 0);
}
