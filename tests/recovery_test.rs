//! Crash-recovery and WAL scenarios.
//!
//! The crash test re-executes this test binary as a child process; the
//! child trips the engine's crash marker, which aborts after the WAL
//! sync but before the checkpoint advances. The parent then reopens the
//! directory and checks that replay restored the tail.

use std::fs;
use std::path::Path;
use std::process::Command;

use pagekv::net::protocol::encode_command;
use pagekv::{Config, DbError, Store};
use tempfile::tempdir;

fn open_store(dir: &Path) -> Store {
    let config = Config {
        data_dir: dir.to_path_buf(),
        rng_seed: Some(2),
        ..Config::default()
    };
    Store::open(&config).unwrap()
}

fn set(store: &Store, key: &[u8], val: &[u8]) {
    let cmd = encode_command(&[b"set", key, val]);
    store.set(&cmd, key, val).unwrap();
}

fn get(store: &Store, key: &[u8]) -> Option<Vec<u8>> {
    match store.get(key) {
        Ok(val) => Some(val),
        Err(DbError::NotFound) => None,
        Err(e) => panic!("get failed: {e}"),
    }
}

fn run_crash_child(dir: &Path) -> ! {
    let store = open_store(dir);
    set(&store, b"saveToDBKey", b"saveToDBValue");
    store.set_crash_key(b"crashKey");
    // Aborts inside here, after the WAL sync.
    set(&store, b"crashKey", b"crashValue");
    unreachable!("crash marker did not fire");
}

#[test]
fn crash_after_wal_sync_recovers_on_reopen() {
    if let Ok(dir) = std::env::var("PAGEKV_CRASH_DIR") {
        run_crash_child(Path::new(&dir));
    }

    let dir = tempdir().unwrap();
    let exe = std::env::current_exe().unwrap();
    let status = Command::new(&exe)
        .args([
            "--exact",
            "crash_after_wal_sync_recovers_on_reopen",
            "--test-threads=1",
        ])
        .env("PAGEKV_CRASH_DIR", dir.path())
        .status()
        .unwrap();
    assert!(!status.success(), "child must die at the crash marker");

    // The WAL kept the crash command; the checkpoint never advanced
    // past it.
    let wal_len = fs::metadata(dir.path().join("wal")).unwrap().len();
    assert!(wal_len > 0, "WAL empty after crash");

    let store = open_store(dir.path());
    assert_eq!(get(&store, b"saveToDBKey").unwrap(), b"saveToDBValue");
    assert_eq!(get(&store, b"crashKey").unwrap(), b"crashValue");
    // Recovery truncated the log and reset the checkpoint.
    assert_eq!(store.wal_len(), 0);
    assert_eq!(store.checkpoint(), 0);
}

#[test]
fn replay_applies_wal_tail_on_open() {
    let dir = tempdir().unwrap();
    let mut tail = Vec::new();
    tail.extend_from_slice(&encode_command(&[b"set", b"a", b"1"]));
    tail.extend_from_slice(&encode_command(&[b"set", b"b", b"2"]));
    tail.extend_from_slice(&encode_command(&[b"set", b"a", b"3"]));
    tail.extend_from_slice(&encode_command(&[b"del", b"b", b"missing"]));
    fs::write(dir.path().join("wal"), &tail).unwrap();

    let store = open_store(dir.path());
    assert_eq!(get(&store, b"a").unwrap(), b"3");
    assert_eq!(get(&store, b"b"), None);
    assert_eq!(store.wal_len(), 0);
}

#[test]
fn replaying_a_duplicated_tail_is_idempotent() {
    let run = |duplicate: bool| {
        let dir = tempdir().unwrap();
        let mut tail = Vec::new();
        tail.extend_from_slice(&encode_command(&[b"set", b"x", b"first"]));
        tail.extend_from_slice(&encode_command(&[b"set", b"y", b"kept"]));
        tail.extend_from_slice(&encode_command(&[b"del", b"x"]));
        if duplicate {
            let copy = tail.clone();
            tail.extend_from_slice(&copy);
        }
        fs::write(dir.path().join("wal"), &tail).unwrap();

        let store = open_store(dir.path());
        (get(&store, b"x"), get(&store, b"y"))
    };

    assert_eq!(run(false), run(true));
    let (x, y) = run(true);
    assert_eq!(x, None);
    assert_eq!(y.unwrap(), b"kept");
}

#[test]
fn replay_stops_cleanly_at_partial_frame() {
    let dir = tempdir().unwrap();
    let mut tail = Vec::new();
    tail.extend_from_slice(&encode_command(&[b"set", b"good", b"applied"]));
    let cut = encode_command(&[b"set", b"torn", b"never-finished"]);
    tail.extend_from_slice(&cut[..cut.len() / 2]);
    fs::write(dir.path().join("wal"), &tail).unwrap();

    let store = open_store(dir.path());
    assert_eq!(get(&store, b"good").unwrap(), b"applied");
    assert_eq!(get(&store, b"torn"), None);
    assert_eq!(store.wal_len(), 0);
}

#[test]
fn wal_rotates_past_threshold() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());

    let big = vec![b'r'; 600 * 1024];
    set(&store, b"rot-a", &big);
    assert!(store.wal_len() > 0);
    // The second append crosses 1 MiB; everything up to the checkpoint
    // is applied, so rotation leaves an empty log.
    set(&store, b"rot-b", &big);
    assert_eq!(store.wal_len(), 0);
    assert_eq!(store.checkpoint(), 0);

    assert_eq!(get(&store, b"rot-a").unwrap(), big);
    assert_eq!(get(&store, b"rot-b").unwrap(), big);

    drop(store);
    let store = open_store(dir.path());
    assert_eq!(get(&store, b"rot-a").unwrap(), big);
    assert_eq!(get(&store, b"rot-b").unwrap(), big);
}

#[test]
fn checkpoint_tracks_wal_length_while_serving() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());

    set(&store, b"k1", b"v1");
    let after_first = store.wal_len();
    assert!(after_first > 0);
    assert_eq!(store.checkpoint(), after_first);

    set(&store, b"k2", b"v2");
    assert!(store.wal_len() > after_first);
    assert_eq!(store.checkpoint(), store.wal_len());
}

#[test]
fn reserved_undo_file_is_created() {
    let dir = tempdir().unwrap();
    let _store = open_store(dir.path());
    let undo = dir.path().join("undo");
    assert!(undo.exists());
    assert_eq!(fs::metadata(undo).unwrap().len(), 0);
}
