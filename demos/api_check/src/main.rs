//! Walks the whole runtime API, misuse first.
//!
//! Every section reports through the runtime's own console path and asserts
//! its expectations, so a run that prints its goodbye line is a pass.
use std::sync::atomic::{AtomicBool, Ordering};

use vmk_kernel::{
    start, AcquireMutexError, ActivateThreadError, AllocatePoolError, Config, CreatePoolError,
    CreateThreadError, DeallocatePoolError, DeleteMutexError, DeletePoolError, DeleteThreadError,
    Kernel, Priority, QueryMutexError, QueryPoolError, QueryThreadError, ReleaseMutexError,
    SleepError, TerminateThreadError, ThreadState, ALLOC_QUANTUM, POOL_ID_INVALID,
    SYSTEM_POOL_ID, THREAD_ID_INVALID, TIMEOUT_IMMEDIATE, TIMEOUT_INFINITE,
};

static MUTEX_TAKEN: AtomicBool = AtomicBool::new(false);

/// Takes the mutex named by its parameter and never lets go; the main
/// thread reclaims it by terminating us mid-spin.
fn grabber(k: &Kernel, mutex: usize) {
    k.mutex_acquire(mutex, TIMEOUT_INFINITE).unwrap();
    MUTEX_TAKEN.store(true, Ordering::SeqCst);
    loop {
        std::hint::spin_loop();
    }
}

fn check_pools(k: &Kernel) {
    k.print("checking the pool operations\n").unwrap();

    assert_eq!(
        k.pool_query(POOL_ID_INVALID),
        Err(QueryPoolError::InvalidParameter),
    );
    let system_free = k.pool_query(SYSTEM_POOL_ID).unwrap();

    assert_eq!(
        k.pool_allocate(SYSTEM_POOL_ID, 0),
        Err(AllocatePoolError::InvalidParameter),
    );
    assert_eq!(
        k.pool_allocate(POOL_ID_INVALID, ALLOC_QUANTUM),
        Err(AllocatePoolError::InvalidParameter),
    );
    assert_eq!(
        k.pool_allocate(SYSTEM_POOL_ID, system_free + 256),
        Err(AllocatePoolError::InsufficientResources),
    );
    let block = k.pool_allocate(SYSTEM_POOL_ID, ALLOC_QUANTUM).unwrap();

    // A private pool carved out of the block just obtained.
    assert_eq!(k.pool_create(0, ALLOC_QUANTUM), Err(CreatePoolError::InvalidParameter));
    assert_eq!(k.pool_create(block, 0), Err(CreatePoolError::InvalidParameter));
    let p = k.pool_create(block, ALLOC_QUANTUM).unwrap();

    // A 32-byte request costs a whole quantum.
    let inner = k.pool_allocate(p, 32).unwrap();
    assert_eq!(inner, block);
    assert_eq!(k.pool_query(p).unwrap(), 0);

    assert_eq!(
        k.pool_deallocate(p, inner + 1),
        Err(DeallocatePoolError::InvalidParameter),
    );
    assert_eq!(
        k.pool_deallocate(POOL_ID_INVALID, inner),
        Err(DeallocatePoolError::InvalidParameter),
    );

    assert_eq!(k.pool_delete(POOL_ID_INVALID), Err(DeletePoolError::InvalidParameter));
    assert_eq!(k.pool_delete(p), Err(DeletePoolError::InvalidState));
    k.pool_deallocate(p, inner).unwrap();
    k.pool_delete(p).unwrap();

    // Deleted pools are gone for good.
    assert_eq!(k.pool_allocate(p, 32), Err(AllocatePoolError::InvalidParameter));
    assert_eq!(k.pool_query(p), Err(QueryPoolError::InvalidParameter));

    k.pool_deallocate(SYSTEM_POOL_ID, block).unwrap();
    assert_eq!(k.pool_query(SYSTEM_POOL_ID).unwrap(), system_free);
}

fn check_clock(k: &Kernel) {
    k.print("checking the clock\n").unwrap();

    let ms = k.tick_ms();
    assert!((1..500).contains(&ms), "implausible tick period: {} ms", ms);

    assert_eq!(k.thread_sleep(TIMEOUT_INFINITE), Err(SleepError::InvalidParameter));
    k.thread_sleep(TIMEOUT_IMMEDIATE).unwrap();

    let before = k.tick_count();
    k.thread_sleep(10).unwrap();
    assert!(k.tick_count() >= before + 10, "woke too soon");
}

fn check_threads_and_mutexes(k: &Kernel) {
    k.print("checking the thread operations\n").unwrap();

    assert_eq!(
        k.thread_create(grabber, 0, 0, Priority::Normal),
        Err(CreateThreadError::InvalidParameter),
    );

    let m = k.mutex_create();
    let bad_mutex = m + 16;
    let t = k.thread_create(grabber, m, 64 * 1024, Priority::Normal).unwrap();
    let me = k.current_thread();
    assert_ne!(me, t);

    assert_eq!(k.thread_state(THREAD_ID_INVALID), Err(QueryThreadError::InvalidId));
    assert_eq!(k.thread_state(t).unwrap(), ThreadState::Dead);

    assert_eq!(
        k.thread_terminate(THREAD_ID_INVALID),
        Err(TerminateThreadError::InvalidId),
    );
    assert_eq!(k.thread_terminate(t), Err(TerminateThreadError::InvalidState));

    assert_eq!(k.mutex_owner(bad_mutex), Err(QueryMutexError::InvalidId));
    assert_eq!(k.mutex_owner(m).unwrap(), None);

    k.print("checking activation and the mutex hand-off\n").unwrap();
    assert_eq!(
        k.thread_activate(THREAD_ID_INVALID),
        Err(ActivateThreadError::InvalidId),
    );
    k.thread_activate(t).unwrap();
    while !MUTEX_TAKEN.load(Ordering::SeqCst) {
        k.thread_sleep(1).unwrap();
    }
    assert_eq!(k.mutex_owner(m).unwrap(), Some(t));

    assert_eq!(
        k.mutex_acquire(bad_mutex, TIMEOUT_INFINITE),
        Err(AcquireMutexError::InvalidId),
    );
    assert_eq!(
        k.mutex_acquire(m, TIMEOUT_IMMEDIATE),
        Err(AcquireMutexError::Failure),
    );
    let before = k.tick_count();
    assert_eq!(k.mutex_acquire(m, 10), Err(AcquireMutexError::Failure));
    assert!(k.tick_count() >= before + 10, "acquire timed out too soon");

    // The holder is alive and the mutex held, so none of these may pass.
    assert_eq!(k.thread_delete(THREAD_ID_INVALID), Err(DeleteThreadError::InvalidId));
    assert_eq!(k.thread_delete(t), Err(DeleteThreadError::InvalidState));
    assert_eq!(k.mutex_delete(bad_mutex), Err(DeleteMutexError::InvalidId));
    assert_eq!(k.mutex_delete(m), Err(DeleteMutexError::InvalidState));
    assert_eq!(k.mutex_release(bad_mutex), Err(ReleaseMutexError::InvalidId));
    assert_eq!(k.mutex_release(m), Err(ReleaseMutexError::InvalidState));

    k.print("reclaiming the spinning holder\n").unwrap();
    k.thread_terminate(t).unwrap();
    assert_eq!(k.thread_state(t).unwrap(), ThreadState::Dead);

    // Termination released its mutex.
    k.mutex_acquire(m, TIMEOUT_IMMEDIATE).unwrap();
    assert_eq!(k.mutex_owner(m).unwrap(), Some(me));
    assert_eq!(
        k.mutex_acquire(m, TIMEOUT_IMMEDIATE),
        Err(AcquireMutexError::Failure),
    );

    k.thread_delete(t).unwrap();
    k.mutex_release(m).unwrap();
    assert_eq!(k.mutex_owner(m).unwrap(), None);
    k.mutex_delete(m).unwrap();
}

fn program(k: &Kernel, _args: &[String]) {
    check_pools(k);
    check_clock(k);
    check_threads_and_mutexes(k);
    k.print("everything behaved; goodbye\n").unwrap();
}

fn main() {
    env_logger::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    start(Config::default(), program, &args).unwrap();
}
