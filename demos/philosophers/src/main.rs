//! Five dining philosophers on the thread runtime.
//!
//! Forks are mutexes. Each philosopher reaches for the lower numbered fork
//! first, so the circular wait of the classic deadlock cannot form. If two
//! neighbors ever eat at the same time the mutexes failed; the main thread
//! checks for that once the table clears.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use vmk_kernel::{start, Config, Kernel, Priority, ThreadState, TIMEOUT_INFINITE};

const SEATS: usize = 5;
const MEALS: usize = 3;

static FORKS: [AtomicUsize; SEATS] = [
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
];
static EATING: [AtomicBool; SEATS] = [
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
];
static OVERLAP: AtomicBool = AtomicBool::new(false);

fn fork(seat: usize) -> usize {
    FORKS[seat].load(Ordering::Relaxed)
}

fn philosopher(k: &Kernel, seat: usize) {
    let first = seat.min((seat + 1) % SEATS);
    let second = seat.max((seat + 1) % SEATS);

    for meal in 1..=MEALS {
        // Think a little; the stagger keeps the table lively.
        k.thread_sleep(1 + (seat as u32 % 3)).unwrap();

        k.mutex_acquire(fork(first), TIMEOUT_INFINITE).unwrap();
        k.mutex_acquire(fork(second), TIMEOUT_INFINITE).unwrap();

        if EATING[(seat + 1) % SEATS].load(Ordering::SeqCst)
            || EATING[(seat + SEATS - 1) % SEATS].load(Ordering::SeqCst)
        {
            OVERLAP.store(true, Ordering::SeqCst);
        }
        EATING[seat].store(true, Ordering::SeqCst);
        let line = format!("philosopher {} eats (meal {} of {})\n", seat, meal, MEALS);
        k.print(&line).unwrap();
        k.thread_sleep(2).unwrap();
        EATING[seat].store(false, Ordering::SeqCst);

        k.mutex_release(fork(second)).unwrap();
        k.mutex_release(fork(first)).unwrap();
    }
}

fn program(k: &Kernel, _args: &[String]) {
    for slot in FORKS.iter() {
        slot.store(k.mutex_create(), Ordering::Relaxed);
    }

    let mut seated = [0usize; SEATS];
    for (seat, id) in seated.iter_mut().enumerate() {
        *id = k
            .thread_create(philosopher, seat, 64 * 1024, Priority::Normal)
            .unwrap();
    }

    k.print("the table is set\n").unwrap();
    for &t in seated.iter() {
        k.thread_activate(t).unwrap();
    }

    for &t in seated.iter() {
        while k.thread_state(t).unwrap() != ThreadState::Dead {
            k.thread_sleep(1).unwrap();
        }
    }
    assert!(!OVERLAP.load(Ordering::SeqCst), "neighbors ate at the same time");

    for &t in seated.iter() {
        k.thread_delete(t).unwrap();
    }
    for slot in FORKS.iter() {
        k.mutex_delete(slot.load(Ordering::Relaxed)).unwrap();
    }
    k.print("everyone has eaten; the table is cleared\n").unwrap();
}

fn main() {
    env_logger::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    start(Config::default(), program, &args).unwrap();
}
