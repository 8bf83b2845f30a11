//! Scenario tests that boot the full runtime.
//!
//! Each test runs its scenario as the program of a fresh [`vmk_kernel::start`]
//! call. Child threads only record what happened into atomics; the boot
//! thread does the asserting, so a failure panics the test thread and not a
//! parked context.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use vmk_kernel::{start, Config, Kernel, Priority, ThreadState, TIMEOUT_INFINITE};

fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .is_test(true)
        .try_init();
}

fn boot(main: vmk_kernel::MainEntry) {
    init_logging();
    start(Config::default(), main, &[]).unwrap();
}

/// Sleeps the calling thread one tick at a time until `pred` holds.
fn wait_until(k: &Kernel, mut pred: impl FnMut() -> bool) {
    while !pred() {
        k.thread_sleep(1).unwrap();
    }
}

fn wait_for_state(k: &Kernel, thread: usize, state: ThreadState) {
    wait_until(k, || k.thread_state(thread).unwrap() == state);
}

mod activation_preemption {
    use super::*;

    static SEQ: AtomicUsize = AtomicUsize::new(0);
    static CHILD_STAMP: AtomicUsize = AtomicUsize::new(0);

    fn child(_k: &Kernel, _param: usize) {
        CHILD_STAMP.store(SEQ.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
    }

    fn main(k: &Kernel, _args: &[String]) {
        let t = k.thread_create(child, 0, 64 * 1024, Priority::High).unwrap();
        k.thread_activate(t).unwrap();
        // A HIGH activation runs before activate returns to NORMAL code.
        let main_stamp = SEQ.fetch_add(1, Ordering::SeqCst) + 1;

        assert_eq!(CHILD_STAMP.load(Ordering::SeqCst), 1);
        assert_eq!(main_stamp, 2);
        assert_eq!(k.thread_state(t).unwrap(), ThreadState::Dead);
        k.thread_delete(t).unwrap();
    }

    #[test]
    fn high_priority_activation_preempts_normal() {
        boot(main);
    }
}

mod equal_priority_rotation {
    use super::*;

    const ROUNDS: usize = 4;
    static SEQ: AtomicUsize = AtomicUsize::new(0);
    static RECORDS: [AtomicUsize; ROUNDS * 3] = [
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
    ];

    fn worker(k: &Kernel, id: usize) {
        for _ in 0..ROUNDS {
            let slot = SEQ.fetch_add(1, Ordering::SeqCst);
            if let Some(cell) = RECORDS.get(slot) {
                cell.store(id, Ordering::SeqCst);
            }
            k.thread_sleep(0).unwrap();
        }
    }

    fn main(k: &Kernel, _args: &[String]) {
        let a = k
            .thread_create(worker, 10, 64 * 1024, Priority::Normal)
            .unwrap();
        let b = k
            .thread_create(worker, 20, 64 * 1024, Priority::Normal)
            .unwrap();
        let c = k
            .thread_create(worker, 30, 64 * 1024, Priority::Normal)
            .unwrap();
        k.thread_activate(a).unwrap();
        k.thread_activate(b).unwrap();
        k.thread_activate(c).unwrap();

        for t in [a, b, c] {
            wait_for_state(k, t, ThreadState::Dead);
        }

        // The lane rotates: every round of three claims is one visit from
        // each worker, whether a yield or a tick caused the rotation.
        let recorded: Vec<usize> = RECORDS
            .iter()
            .map(|cell| cell.load(Ordering::SeqCst))
            .collect();
        for round in recorded.chunks(3) {
            let mut round = round.to_vec();
            round.sort_unstable();
            assert_eq!(round, vec![10, 20, 30], "unfair rotation: {:?}", recorded);
        }

        for t in [a, b, c] {
            k.thread_delete(t).unwrap();
        }
    }

    #[test]
    fn yielding_equals_rotate_fairly() {
        boot(main);
    }
}

mod sleep_durations {
    use super::*;

    fn main(k: &Kernel, _args: &[String]) {
        let before = k.tick_count();
        k.thread_sleep(5).unwrap();
        let after = k.tick_count();
        assert!(
            after - before >= 5,
            "slept only {} ticks",
            after - before,
        );
    }

    #[test]
    fn sleep_lasts_at_least_the_requested_ticks() {
        boot(main);
    }
}

mod mutex_hand_off {
    use super::*;

    static SEQ: AtomicUsize = AtomicUsize::new(0);
    static STAMP_HIGH: AtomicUsize = AtomicUsize::new(0);
    static STAMP_NORMAL: AtomicUsize = AtomicUsize::new(0);
    static STAMP_LOW: AtomicUsize = AtomicUsize::new(0);

    fn contender(k: &Kernel, param: usize) {
        let mutex = param >> 2;
        k.mutex_acquire(mutex, TIMEOUT_INFINITE).unwrap();
        let stamp = SEQ.fetch_add(1, Ordering::SeqCst) + 1;
        match param & 3 {
            0 => STAMP_HIGH.store(stamp, Ordering::SeqCst),
            1 => STAMP_NORMAL.store(stamp, Ordering::SeqCst),
            _ => STAMP_LOW.store(stamp, Ordering::SeqCst),
        }
        k.mutex_release(mutex).unwrap();
    }

    fn main(k: &Kernel, _args: &[String]) {
        let m = k.mutex_create();
        k.mutex_acquire(m, TIMEOUT_INFINITE).unwrap();

        // Queue a LOW, a NORMAL, and a HIGH waiter, in that order.
        let lo = k
            .thread_create(contender, (m << 2) | 2, 64 * 1024, Priority::Low)
            .unwrap();
        let no = k
            .thread_create(contender, (m << 2) | 1, 64 * 1024, Priority::Normal)
            .unwrap();
        let hi = k
            .thread_create(contender, m << 2, 64 * 1024, Priority::High)
            .unwrap();
        for t in [lo, no, hi] {
            k.thread_activate(t).unwrap();
        }
        for t in [lo, no, hi] {
            wait_for_state(k, t, ThreadState::Waiting);
        }

        k.mutex_release(m).unwrap();
        for t in [lo, no, hi] {
            wait_for_state(k, t, ThreadState::Dead);
        }

        // Hand-off order is priority first, arrival second.
        assert_eq!(STAMP_HIGH.load(Ordering::SeqCst), 1);
        assert_eq!(STAMP_NORMAL.load(Ordering::SeqCst), 2);
        assert_eq!(STAMP_LOW.load(Ordering::SeqCst), 3);

        assert_eq!(k.mutex_owner(m).unwrap(), None);
        for t in [lo, no, hi] {
            k.thread_delete(t).unwrap();
        }
        k.mutex_delete(m).unwrap();
    }

    #[test]
    fn contended_mutex_goes_to_waiters_by_priority() {
        boot(main);
    }
}

mod infinite_waiters {
    use super::*;

    static SEQ: AtomicUsize = AtomicUsize::new(0);
    static FIRST: AtomicUsize = AtomicUsize::new(0);
    static SECOND: AtomicUsize = AtomicUsize::new(0);

    fn waiter(k: &Kernel, param: usize) {
        let mutex = param >> 1;
        k.mutex_acquire(mutex, TIMEOUT_INFINITE).unwrap();
        let stamp = SEQ.fetch_add(1, Ordering::SeqCst) + 1;
        if param & 1 == 0 {
            FIRST.store(stamp, Ordering::SeqCst);
        } else {
            SECOND.store(stamp, Ordering::SeqCst);
        }
        k.mutex_release(mutex).unwrap();
    }

    fn main(k: &Kernel, _args: &[String]) {
        let m = k.mutex_create();
        k.mutex_acquire(m, TIMEOUT_INFINITE).unwrap();

        let a = k
            .thread_create(waiter, m << 1, 64 * 1024, Priority::Normal)
            .unwrap();
        let b = k
            .thread_create(waiter, (m << 1) | 1, 64 * 1024, Priority::Normal)
            .unwrap();
        k.thread_activate(a).unwrap();
        wait_for_state(k, a, ThreadState::Waiting);
        k.thread_activate(b).unwrap();
        wait_for_state(k, b, ThreadState::Waiting);

        // Both block forever until the owner lets go; then they go in
        // arrival order, each woken by the other's release.
        k.mutex_release(m).unwrap();
        wait_for_state(k, a, ThreadState::Dead);
        wait_for_state(k, b, ThreadState::Dead);
        assert_eq!(FIRST.load(Ordering::SeqCst), 1);
        assert_eq!(SECOND.load(Ordering::SeqCst), 2);

        k.thread_delete(a).unwrap();
        k.thread_delete(b).unwrap();
        k.mutex_delete(m).unwrap();
    }

    #[test]
    fn two_infinite_waiters_acquire_in_turn() {
        boot(main);
    }
}

mod timeout_race {
    use super::*;

    static WON: AtomicBool = AtomicBool::new(false);
    static DONE: AtomicBool = AtomicBool::new(false);
    static LOST: AtomicBool = AtomicBool::new(false);
    static WAITED: AtomicUsize = AtomicUsize::new(0);
    static LOSER_DONE: AtomicBool = AtomicBool::new(false);

    fn racer(k: &Kernel, mutex: usize) {
        if k.mutex_acquire(mutex, 10).is_ok() {
            WON.store(true, Ordering::SeqCst);
            k.mutex_release(mutex).unwrap();
        }
        DONE.store(true, Ordering::SeqCst);
    }

    fn loser(k: &Kernel, mutex: usize) {
        let before = k.tick_count();
        let refused = k.mutex_acquire(mutex, 3).is_err();
        let waited = k.tick_count() - before;
        LOST.store(refused, Ordering::SeqCst);
        WAITED.store(waited as usize, Ordering::SeqCst);
        LOSER_DONE.store(true, Ordering::SeqCst);
    }

    fn main(k: &Kernel, _args: &[String]) {
        // Released before the timeout: the waiter gets the mutex.
        let m = k.mutex_create();
        k.mutex_acquire(m, TIMEOUT_INFINITE).unwrap();
        let t = k.thread_create(racer, m, 64 * 1024, Priority::Normal).unwrap();
        k.thread_activate(t).unwrap();
        wait_for_state(k, t, ThreadState::Waiting);
        k.thread_sleep(2).unwrap();
        k.mutex_release(m).unwrap();
        wait_for_state(k, t, ThreadState::Dead);
        assert!(DONE.load(Ordering::SeqCst));
        assert!(WON.load(Ordering::SeqCst));
        k.thread_delete(t).unwrap();

        // Never released: the waiter comes back refused, no earlier than
        // its timeout.
        k.mutex_acquire(m, TIMEOUT_INFINITE).unwrap();
        let t = k.thread_create(loser, m, 64 * 1024, Priority::Normal).unwrap();
        k.thread_activate(t).unwrap();
        wait_for_state(k, t, ThreadState::Dead);
        assert!(LOSER_DONE.load(Ordering::SeqCst));
        assert!(LOST.load(Ordering::SeqCst));
        assert!(WAITED.load(Ordering::SeqCst) >= 3);
        k.thread_delete(t).unwrap();
        k.mutex_release(m).unwrap();
        k.mutex_delete(m).unwrap();
    }

    #[test]
    fn timed_acquire_wins_or_loses_by_the_clock() {
        boot(main);
    }
}

mod self_acquire {
    use super::*;
    use vmk_kernel::{AcquireMutexError, TIMEOUT_IMMEDIATE};

    fn main(k: &Kernel, _args: &[String]) {
        let m = k.mutex_create();
        k.mutex_acquire(m, TIMEOUT_IMMEDIATE).unwrap();

        // The owner is refused again at once for every timeout class; the
        // finite class does not wait out its ticks.
        let before = k.tick_count();
        assert_eq!(
            k.mutex_acquire(m, TIMEOUT_IMMEDIATE),
            Err(AcquireMutexError::Failure),
        );
        assert_eq!(k.mutex_acquire(m, 10), Err(AcquireMutexError::Failure));
        assert_eq!(
            k.mutex_acquire(m, TIMEOUT_INFINITE),
            Err(AcquireMutexError::Failure),
        );
        assert!(
            k.tick_count() - before < 10,
            "a refused self-acquire waited for the timeout",
        );
        assert_eq!(k.mutex_owner(m).unwrap(), Some(k.current_thread()));

        k.mutex_release(m).unwrap();
        k.mutex_delete(m).unwrap();
    }

    #[test]
    fn reacquiring_a_held_mutex_fails_without_waiting() {
        boot(main);
    }
}

mod terminate_cleanup {
    use super::*;

    static GOT_IT: AtomicBool = AtomicBool::new(false);
    static HOLDER_READY: AtomicBool = AtomicBool::new(false);

    fn holder(k: &Kernel, mutex: usize) {
        k.mutex_acquire(mutex, TIMEOUT_INFINITE).unwrap();
        HOLDER_READY.store(true, Ordering::SeqCst);
        // Never releases on its own.
        let _ = k.thread_sleep(10_000);
    }

    fn waiter(k: &Kernel, mutex: usize) {
        k.mutex_acquire(mutex, TIMEOUT_INFINITE).unwrap();
        GOT_IT.store(true, Ordering::SeqCst);
        k.mutex_release(mutex).unwrap();
    }

    fn main(k: &Kernel, _args: &[String]) {
        let m = k.mutex_create();
        let a = k.thread_create(holder, m, 64 * 1024, Priority::Normal).unwrap();
        let b = k.thread_create(waiter, m, 64 * 1024, Priority::Normal).unwrap();
        k.thread_activate(a).unwrap();
        wait_until(k, || HOLDER_READY.load(Ordering::SeqCst));
        k.thread_activate(b).unwrap();
        wait_for_state(k, b, ThreadState::Waiting);
        assert_eq!(k.mutex_owner(m).unwrap(), Some(a));

        // Killing the holder hands its mutex to the waiter.
        k.thread_terminate(a).unwrap();
        wait_for_state(k, b, ThreadState::Dead);
        assert!(GOT_IT.load(Ordering::SeqCst));
        assert_eq!(k.thread_state(a).unwrap(), ThreadState::Dead);

        k.thread_delete(a).unwrap();
        k.thread_delete(b).unwrap();
        k.mutex_delete(m).unwrap();
    }

    #[test]
    fn terminating_a_holder_releases_its_mutex() {
        boot(main);
    }
}

mod slot_reuse {
    use super::*;

    fn noop(_k: &Kernel, _param: usize) {}

    fn main(k: &Kernel, _args: &[String]) {
        // Thread slots: lowest tombstone first, boot slots never touched.
        let a = k.thread_create(noop, 0, 64 * 1024, Priority::Normal).unwrap();
        let b = k.thread_create(noop, 0, 64 * 1024, Priority::Normal).unwrap();
        assert_eq!((a, b), (2, 3));
        k.thread_delete(a).unwrap();
        let c = k.thread_create(noop, 0, 64 * 1024, Priority::Normal).unwrap();
        assert_eq!(c, 2);

        // Mutex slots reuse too.
        let m0 = k.mutex_create();
        let m1 = k.mutex_create();
        k.mutex_delete(m0).unwrap();
        assert_eq!(k.mutex_create(), m0);

        // Pool ids never come back.
        let p = k.pool_create(0x4000_0000, 4096).unwrap();
        k.pool_delete(p).unwrap();
        let q = k.pool_create(0x4000_0000, 4096).unwrap();
        assert_ne!(p, q);
        k.pool_delete(q).unwrap();

        k.thread_delete(b).unwrap();
        k.thread_delete(c).unwrap();
        k.mutex_delete(m0).unwrap();
        k.mutex_delete(m1).unwrap();
    }

    #[test]
    fn ids_are_reused_lowest_first_except_pools() {
        boot(main);
    }
}

mod expired_waiter_cleanup {
    use super::*;
    use vmk_kernel::TIMEOUT_IMMEDIATE;

    static SEQ: AtomicUsize = AtomicUsize::new(0);
    static FIRST: AtomicUsize = AtomicUsize::new(0);
    static SECOND: AtomicUsize = AtomicUsize::new(0);

    fn expiring(k: &Kernel, mutex: usize) {
        let _ = k.mutex_acquire(mutex, 5);
    }

    fn granted(k: &Kernel, param: usize) {
        let mutex = param >> 1;
        k.mutex_acquire(mutex, TIMEOUT_INFINITE).unwrap();
        let stamp = SEQ.fetch_add(1, Ordering::SeqCst) + 1;
        if param & 1 == 0 {
            FIRST.store(stamp, Ordering::SeqCst);
        } else {
            SECOND.store(stamp, Ordering::SeqCst);
        }
        k.mutex_release(mutex).unwrap();
    }

    fn main(k: &Kernel, _args: &[String]) {
        let m = k.mutex_create();
        k.mutex_acquire(m, TIMEOUT_IMMEDIATE).unwrap();

        let v = k.thread_create(expiring, m, 64 * 1024, Priority::Low).unwrap();
        let w = k
            .thread_create(granted, m << 1, 64 * 1024, Priority::Low)
            .unwrap();
        k.thread_activate(v).unwrap();
        wait_for_state(k, v, ThreadState::Waiting);

        // Poll without sleeping: a LOW thread cannot preempt this one, so
        // the expired waiter stays queued, entry and all, until terminated.
        while k.thread_state(v).unwrap() != ThreadState::Ready {}
        k.thread_terminate(v).unwrap();
        k.thread_delete(v).unwrap();

        k.thread_activate(w).unwrap();
        wait_for_state(k, w, ThreadState::Waiting);

        // The next create takes the dead waiter's slot.
        let t = k
            .thread_create(granted, (m << 1) | 1, 64 * 1024, Priority::Low)
            .unwrap();
        assert_eq!(t, v);
        k.thread_activate(t).unwrap();
        wait_for_state(k, t, ThreadState::Waiting);

        k.mutex_release(m).unwrap();
        wait_for_state(k, w, ThreadState::Dead);
        wait_for_state(k, t, ThreadState::Dead);

        // Hand-off goes by arrival; the reused slot starts from a clean
        // queue instead of inheriting its predecessor's position.
        assert_eq!(FIRST.load(Ordering::SeqCst), 1);
        assert_eq!(SECOND.load(Ordering::SeqCst), 2);

        k.thread_delete(w).unwrap();
        k.thread_delete(t).unwrap();
        k.mutex_delete(m).unwrap();
    }

    #[test]
    fn reused_slot_does_not_inherit_a_wait_queue_entry() {
        boot(main);
    }
}

mod pool_walk {
    use super::*;
    use vmk_kernel::ALLOC_QUANTUM;

    fn main(k: &Kernel, _args: &[String]) {
        // The classic 256-byte fragmentation walk, end to end through the
        // public operations.
        let p = k.pool_create(0x5000_0000, 4 * ALLOC_QUANTUM).unwrap();
        let a = k.pool_allocate(p, 64).unwrap();
        let b = k.pool_allocate(p, 64).unwrap();
        let c = k.pool_allocate(p, 64).unwrap();
        let d = k.pool_allocate(p, 64).unwrap();
        assert_eq!(k.pool_query(p).unwrap(), 0);

        k.pool_deallocate(p, b).unwrap();
        k.pool_deallocate(p, d).unwrap();
        // 128 bytes free, but in two separate 64-byte holes.
        assert_eq!(k.pool_query(p).unwrap(), 128);
        assert!(k.pool_allocate(p, 128).is_err());

        k.pool_deallocate(p, c).unwrap();
        // b..d coalesced; 128 contiguous bytes fit now.
        assert_eq!(k.pool_allocate(p, 128).unwrap(), b);

        k.pool_deallocate(p, a).unwrap();
        k.pool_deallocate(p, b).unwrap();
        assert_eq!(k.pool_query(p).unwrap(), 4 * ALLOC_QUANTUM);
        k.pool_delete(p).unwrap();
    }

    #[test]
    fn freed_neighbors_coalesce_into_usable_spans() {
        boot(main);
    }
}

mod io_errors {
    use super::*;
    use vmk_kernel::IoError;

    fn main(k: &Kernel, _args: &[String]) {
        // The failure comes back through the completion path, not a panic.
        assert_eq!(
            k.file_open("/nonexistent-dir-vmk/x", 0, 0),
            Err(IoError::Failure),
        );
        // Interior NUL never reaches the machine.
        assert_eq!(
            k.file_open("bad\0path", 0, 0),
            Err(IoError::InvalidParameter),
        );
    }

    #[test]
    fn failed_opens_surface_as_errors() {
        boot(main);
    }
}
