//! Integration tests for lock acquisition, conflicts, and waiting through
//! the public API.
//!
//! Two descriptors of the same process are distinct owners (an owner is a
//! `(pid, fd)` pair), so conflict semantics are observable without a
//! second process.

#[allow(dead_code)]
mod common;

use common::TestEnv;
use reglock::{LockCommand, LockLibrary, LockMode, LockOutcome, LockRequest, Owner};
use std::time::{Duration, Instant};

#[test]
fn test_exclusive_conflict_and_release() {
    let mut env = TestEnv::new("conflict");
    let a = env.open();
    let b = env.open();

    // A holds [0, 10) exclusively; B wants [5, 15).
    let outcome = env
        .lib
        .lock(&a, LockCommand::TrySet, &LockRequest::exclusive(0, 10))
        .unwrap();
    assert_eq!(outcome, LockOutcome::Granted);

    match env
        .lib
        .lock(&b, LockCommand::TrySet, &LockRequest::exclusive(5, 15))
        .unwrap()
    {
        LockOutcome::WouldBlock { owner } => {
            assert_eq!(owner, Owner::current(a.raw_fd()));
        }
        other => panic!("expected WouldBlock, got {:?}", other),
    }

    // A releases; B's retry goes through.
    env.lib
        .lock(&a, LockCommand::TrySet, &LockRequest::unlock(0, 10))
        .unwrap();
    let outcome = env
        .lib
        .lock(&b, LockCommand::TrySet, &LockRequest::exclusive(5, 15))
        .unwrap();
    assert_eq!(outcome, LockOutcome::Granted);

    env.lib.close(a).unwrap();
    env.lib.close(b).unwrap();
}

#[test]
fn test_close_releases_all_locks() {
    let mut env = TestEnv::new("close");
    let a = env.open();
    let b = env.open();

    env.lib
        .lock(&a, LockCommand::TrySet, &LockRequest::exclusive(0, 0))
        .unwrap();
    assert!(matches!(
        env.lib
            .lock(&b, LockCommand::TrySet, &LockRequest::shared(50, 10))
            .unwrap(),
        LockOutcome::WouldBlock { .. }
    ));

    env.lib.close(a).unwrap();

    assert_eq!(
        env.lib
            .lock(&b, LockCommand::TrySet, &LockRequest::shared(50, 10))
            .unwrap(),
        LockOutcome::Granted
    );
    env.lib.close(b).unwrap();
}

#[test]
fn test_shared_locks_coexist() {
    let mut env = TestEnv::new("sharedok");
    let a = env.open();
    let b = env.open();

    assert_eq!(
        env.lib
            .lock(&a, LockCommand::TrySet, &LockRequest::shared(0, 20))
            .unwrap(),
        LockOutcome::Granted
    );
    assert_eq!(
        env.lib
            .lock(&b, LockCommand::TrySet, &LockRequest::shared(10, 20))
            .unwrap(),
        LockOutcome::Granted
    );

    // An exclusive request over the shared region blocks.
    assert!(matches!(
        env.lib
            .lock(&b, LockCommand::TrySet, &LockRequest::exclusive(0, 5))
            .unwrap(),
        LockOutcome::WouldBlock { .. }
    ));

    env.lib.close(a).unwrap();
    env.lib.close(b).unwrap();
}

#[test]
fn test_adjacent_shared_grants_merge_into_one_record() {
    let mut env = TestEnv::new("merge");
    let a = env.open();
    let b = env.open();

    env.lib
        .lock(&a, LockCommand::TrySet, &LockRequest::shared(0, 5))
        .unwrap();
    env.lib
        .lock(&a, LockCommand::TrySet, &LockRequest::shared(5, 5))
        .unwrap();

    // The merged record is observable through the conflict query: one
    // record covering [0, 10).
    let conflict = env
        .lib
        .get_lock(&b, &LockRequest::exclusive(0, 10))
        .unwrap()
        .expect("merged record should conflict");
    assert_eq!(conflict.start, 0);
    assert_eq!(conflict.len, 10);
    assert_eq!(conflict.mode, LockMode::Shared);

    env.lib.close(a).unwrap();
    env.lib.close(b).unwrap();
}

#[test]
fn test_interior_unlock_splits_held_range() {
    let mut env = TestEnv::new("split");
    let a = env.open();
    let b = env.open();

    env.lib
        .lock(&a, LockCommand::TrySet, &LockRequest::exclusive(0, 30))
        .unwrap();
    env.lib
        .lock(&a, LockCommand::TrySet, &LockRequest::unlock(10, 10))
        .unwrap();

    // The gap is free for B; the residuals still conflict.
    assert_eq!(
        env.lib
            .lock(&b, LockCommand::TrySet, &LockRequest::exclusive(10, 10))
            .unwrap(),
        LockOutcome::Granted
    );
    assert!(matches!(
        env.lib
            .lock(&b, LockCommand::TrySet, &LockRequest::exclusive(0, 10))
            .unwrap(),
        LockOutcome::WouldBlock { .. }
    ));
    assert!(matches!(
        env.lib
            .lock(&b, LockCommand::TrySet, &LockRequest::exclusive(20, 10))
            .unwrap(),
        LockOutcome::WouldBlock { .. }
    ));

    env.lib.close(a).unwrap();
    env.lib.close(b).unwrap();
}

#[test]
fn test_unbounded_lock_blocks_only_at_or_past_its_start() {
    let mut env = TestEnv::new("unbounded");
    let a = env.open();
    let b = env.open();

    env.lib
        .lock(&a, LockCommand::TrySet, &LockRequest::exclusive(10, 0))
        .unwrap();

    assert_eq!(
        env.lib
            .lock(&b, LockCommand::TrySet, &LockRequest::exclusive(0, 10))
            .unwrap(),
        LockOutcome::Granted
    );
    assert!(matches!(
        env.lib
            .lock(&b, LockCommand::TrySet, &LockRequest::shared(500, 0))
            .unwrap(),
        LockOutcome::WouldBlock { .. }
    ));

    env.lib.close(a).unwrap();
    env.lib.close(b).unwrap();
}

#[test]
fn test_wait_deadline_expires_as_would_block() {
    let mut env = TestEnv::new("deadline");
    let a = env.open();
    let b = env.open();

    env.lib
        .lock(&a, LockCommand::TrySet, &LockRequest::exclusive(0, 10))
        .unwrap();

    let started = Instant::now();
    let outcome = env
        .lib
        .lock(
            &b,
            LockCommand::SetWait {
                deadline: Some(Duration::from_millis(80)),
            },
            &LockRequest::exclusive(0, 10),
        )
        .unwrap();
    assert!(matches!(outcome, LockOutcome::WouldBlock { .. }));
    assert!(started.elapsed() >= Duration::from_millis(80));

    env.lib.close(a).unwrap();
    env.lib.close(b).unwrap();
}

#[test]
fn test_waiter_is_woken_by_release() {
    let mut env = TestEnv::new("wake");
    let config = env.config();
    let path = env.path.clone();

    // A second library context in another thread stands in for another
    // process: it shares nothing with ours except the registry.
    let (tx, rx) = std::sync::mpsc::channel();
    let holder = std::thread::spawn(move || {
        let mut lib = LockLibrary::with_config(config).unwrap();
        let file = lib.open(&path, libc::O_RDWR, 0).unwrap();
        lib.lock(&file, LockCommand::TrySet, &LockRequest::exclusive(0, 10))
            .unwrap();
        tx.send(()).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        lib.lock(&file, LockCommand::TrySet, &LockRequest::unlock(0, 10))
            .unwrap();
        lib.close(file).unwrap();
    });

    rx.recv().unwrap();
    let file = env.open();
    let outcome = env
        .lib
        .lock(
            &file,
            LockCommand::SetWait {
                deadline: Some(Duration::from_secs(10)),
            },
            &LockRequest::exclusive(0, 10),
        )
        .unwrap();
    assert_eq!(outcome, LockOutcome::Granted);

    holder.join().unwrap();
    env.lib.close(file).unwrap();
}

#[test]
fn test_dup_shares_ownership() {
    let mut env = TestEnv::new("dup");
    let a = env.open();

    env.lib
        .lock(&a, LockCommand::TrySet, &LockRequest::exclusive(0, 10))
        .unwrap();

    let dup = env.lib.dup(&a).unwrap();
    // The duplicate may release the range the original locked.
    env.lib
        .lock(&dup, LockCommand::TrySet, &LockRequest::unlock(0, 10))
        .unwrap();

    // Unlock through the duplicate removes only the duplicate's owner
    // entry; the original descriptor still holds the range.
    let b = env.open();
    assert!(matches!(
        env.lib
            .lock(&b, LockCommand::TrySet, &LockRequest::exclusive(0, 10))
            .unwrap(),
        LockOutcome::WouldBlock { .. }
    ));

    env.lib.close(a).unwrap();
    env.lib.close(dup).unwrap();
    env.lib.close(b).unwrap();
}
