//! Cross-process test: fork inheritance and reclamation of locks left
//! behind by a holder that exited without releasing them.
//!
//! Kept to a single `#[test]` because `fork(2)` in a multi-threaded test
//! harness is only safe when the child confines itself to async-signal
//! territory plus the shared registry, and because test ordering around
//! a shared registry object is easiest to reason about in one function.

#[allow(dead_code)]
mod common;

use common::TestEnv;
use reglock::{ForkOutcome, LockCommand, LockOutcome, LockRequest};

#[test]
fn test_fork_inheritance_and_dead_holder_reclaim() {
    let mut env = TestEnv::new("fork");
    let file = env.open();

    env.lib
        .lock(&file, LockCommand::TrySet, &LockRequest::exclusive(0, 10))
        .unwrap();

    let child = match env.lib.fork_with_locks().unwrap() {
        ForkOutcome::Child => {
            // The child co-owns [0, 10) under the same fd, so a lock it
            // takes beside it must be granted. It then exits without
            // closing: its entries stay in the table until reclaimed.
            let ok = matches!(
                env.lib
                    .lock(&file, LockCommand::TrySet, &LockRequest::exclusive(20, 5)),
                Ok(LockOutcome::Granted)
            );
            unsafe { libc::_exit(if ok { 0 } else { 1 }) };
        }
        ForkOutcome::Parent { child } => child,
    };

    let mut status: libc::c_int = 0;
    let waited = unsafe { libc::waitpid(child, &mut status, 0) };
    assert_eq!(waited, child);
    assert!(libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0);

    // [20, 5) is still held by the dead child. The conflict probe sees a
    // dead pid, the entry is reclaimed, and the request goes through.
    let second = env.open();
    assert_eq!(
        env.lib
            .lock(&second, LockCommand::TrySet, &LockRequest::exclusive(20, 5))
            .unwrap(),
        LockOutcome::Granted
    );

    // The parent's own range survived both the fork and the reclaim.
    let conflict = env
        .lib
        .get_lock(&second, &LockRequest::exclusive(0, 10))
        .unwrap()
        .expect("parent's lock should still be on record");
    assert_eq!(conflict.start, 0);
    assert_eq!(conflict.len, 10);

    env.lib.close(file).unwrap();
    env.lib.close(second).unwrap();
}
