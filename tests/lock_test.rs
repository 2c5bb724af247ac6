use std::fs;

use tempfile::TempDir;

use drover::lock::try_acquire;

// --- Acquire and release ---

#[test]
fn acquire_writes_pid_file() {
    let dir = TempDir::new().expect("Failed to create temp dir");

    let _guard = try_acquire(dir.path()).expect("Lock should be acquired");

    let pid = fs::read_to_string(dir.path().join("drover.pid")).expect("PID file should exist");
    assert_eq!(pid, std::process::id().to_string());
    assert!(dir.path().join("drover.lock").exists());
}

#[test]
fn drop_removes_pid_file() {
    let dir = TempDir::new().expect("Failed to create temp dir");

    let guard = try_acquire(dir.path()).expect("Lock should be acquired");
    drop(guard);

    assert!(
        !dir.path().join("drover.pid").exists(),
        "Expected the PID file removed on release"
    );
}

#[test]
fn creates_nested_state_dir() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let state_dir = dir.path().join("deep").join("nested").join(".drover");

    let _guard = try_acquire(&state_dir).expect("Lock should be acquired");

    assert!(state_dir.join("drover.pid").exists());
}

#[test]
fn reacquire_after_release() {
    let dir = TempDir::new().expect("Failed to create temp dir");

    let guard = try_acquire(dir.path()).expect("Lock should be acquired");
    drop(guard);

    let _guard = try_acquire(dir.path()).expect("Lock should be acquired again");
}

// --- Contention ---

#[test]
fn second_instance_refused_while_held() {
    let dir = TempDir::new().expect("Failed to create temp dir");

    let _guard = try_acquire(dir.path()).expect("Lock should be acquired");
    let err = try_acquire(dir.path()).expect_err("Second acquire should fail");

    assert!(
        err.contains("Another drover instance is running"),
        "Expected the holder reported, got: {}",
        err
    );
    assert!(
        err.contains(&std::process::id().to_string()),
        "Expected the holder PID named, got: {}",
        err
    );
}

#[test]
fn stale_dead_pid_file_does_not_block() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    // A PID file left behind without a held lock; the recorded process is
    // long gone.
    fs::write(dir.path().join("drover.pid"), "99999999").expect("Failed to write PID file");

    let _guard = try_acquire(dir.path()).expect("A free lock should be acquired");

    let pid = fs::read_to_string(dir.path().join("drover.pid")).expect("PID file should exist");
    assert_eq!(pid, std::process::id().to_string(), "Expected the PID file rewritten");
}

#[test]
fn garbage_pid_file_does_not_block() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    fs::write(dir.path().join("drover.pid"), "not-a-pid").expect("Failed to write PID file");

    let _guard = try_acquire(dir.path()).expect("A free lock should be acquired");
}

#[test]
fn external_hold_without_pid_file_names_lock_path() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let lock_path = dir.path().join("drover.lock");

    let mut external = fslock::LockFile::open(&lock_path).expect("Failed to open lock file");
    assert!(external.try_lock().expect("External lock should be acquired"));

    let err = try_acquire(dir.path()).expect_err("Acquire should fail");
    assert!(
        err.contains("Another drover instance holds the lock"),
        "Expected the generic contention message, got: {}",
        err
    );
    assert!(
        err.contains("drover.lock"),
        "Expected the lock path named, got: {}",
        err
    );
}

#[test]
fn external_hold_with_dead_pid_reports_recovery_steps() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let lock_path = dir.path().join("drover.lock");
    fs::write(dir.path().join("drover.pid"), "99999999").expect("Failed to write PID file");

    let mut external = fslock::LockFile::open(&lock_path).expect("Failed to open lock file");
    assert!(external.try_lock().expect("External lock should be acquired"));

    let err = try_acquire(dir.path()).expect_err("Acquire should fail");
    assert!(
        err.contains("is not alive"),
        "Expected the dead holder reported, got: {}",
        err
    );
    assert!(
        err.contains("Remove"),
        "Expected recovery instructions, got: {}",
        err
    );
}
