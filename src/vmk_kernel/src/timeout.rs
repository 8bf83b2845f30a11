//! The periodic tick: counting time and expiring sleeps.
use crate::sched;
use crate::thread::ThreadState;
use crate::{Kernel, KernelShared, KernelState, Tick};

impl KernelState {
    /// Advances time by one tick.
    ///
    /// Every sleeper's remaining count drops by one; the ones that reach
    /// zero go READY in sleep-set order. A thread still queued on a mutex
    /// when its timeout expires keeps its queue entry; the release side
    /// discards it as stale, and the thread cleans up after itself once
    /// dispatched.
    pub(crate) fn advance_tick(&mut self) {
        self.tick_count = self.tick_count.wrapping_add(1);

        let mut i = 0;
        while i < self.sleepers.len() {
            let thread = self.sleepers[i];
            let expired = {
                let tcb = self.thread_mut(thread).expect("sleeping thread vanished");
                tcb.sleep_ticks -= 1;
                tcb.sleep_ticks == 0
            };
            if expired {
                log::trace!("tick {}: waking {}", self.tick_count, thread);
                self.sleepers.remove(i);
                let prio = self.thread(thread).expect("sleeping thread vanished").prio;
                self.thread_mut(thread).expect("sleeping thread vanished").state =
                    ThreadState::Ready;
                self.ready.enqueue(prio, thread);
            } else {
                i += 1;
            }
        }
    }
}

/// Handles one alarm interrupt.
pub(crate) fn on_tick(shared: &KernelShared) {
    shared.state.lock().advance_tick();
    sched::schedule(shared);
}

impl Kernel {
    /// Ticks elapsed since [`start`](crate::start).
    pub fn tick_count(&self) -> Tick {
        let _mask = self.mask();
        self.shared.state.lock().tick_count
    }

    /// The configured tick interval in milliseconds.
    pub fn tick_ms(&self) -> u32 {
        self.shared.tick_ms
    }
}
