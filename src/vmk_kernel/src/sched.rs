//! The ready queues and the dispatcher.
//!
//! One FIFO lane per priority. A thread is in at most one lane, and only
//! while READY; the running thread and the idle thread are never queued. All
//! scheduling decisions reduce to [`preempt_lane`] plus popping the chosen
//! lane's head.
use std::collections::VecDeque;

use crate::thread::{Priority, ThreadState};
use crate::{KernelShared, KernelState, ThreadId, IDLE_THREAD};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lane {
    High,
    Normal,
    Low,
}

impl Lane {
    pub(crate) const ALL: [Lane; 3] = [Lane::High, Lane::Normal, Lane::Low];

    pub(crate) fn index(self) -> usize {
        match self {
            Lane::High => 0,
            Lane::Normal => 1,
            Lane::Low => 2,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ReadyQueues {
    lanes: [VecDeque<ThreadId>; 3],
}

impl ReadyQueues {
    /// Appends a thread to its priority's lane. The idle thread is dispatched
    /// directly when nothing else is runnable and is never queued.
    pub(crate) fn enqueue(&mut self, prio: Priority, thread: ThreadId) {
        if thread == IDLE_THREAD {
            return;
        }
        self.lanes[prio.lane().index()].push_back(thread);
    }

    /// Removes a thread from its lane, preserving the order of the rest.
    pub(crate) fn remove(&mut self, prio: Priority, thread: ThreadId) {
        self.lanes[prio.lane().index()].retain(|&t| t != thread);
    }

    pub(crate) fn pop(&mut self, lane: Lane) -> Option<ThreadId> {
        self.lanes[lane.index()].pop_front()
    }

    pub(crate) fn pop_first(&mut self) -> Option<ThreadId> {
        Lane::ALL.iter().find_map(|&lane| self.pop(lane))
    }

    pub(crate) fn occupancy(&self) -> [bool; 3] {
        [
            !self.lanes[0].is_empty(),
            !self.lanes[1].is_empty(),
            !self.lanes[2].is_empty(),
        ]
    }
}

/// The lane whose head should preempt a running thread of rank `cur_rank`,
/// if any.
///
/// A non-empty HIGH lane always preempts. NORMAL and LOW take over from a
/// runner at their own rank or below, so equal priorities round-robin
/// through every lane; only a strictly higher ranked runner is left alone.
pub(crate) fn preempt_lane(cur_rank: u8, occupancy: [bool; 3]) -> Option<Lane> {
    if occupancy[Lane::High.index()] {
        Some(Lane::High)
    } else if cur_rank < Priority::High.rank() && occupancy[Lane::Normal.index()] {
        Some(Lane::Normal)
    } else if cur_rank < Priority::Normal.rank() && occupancy[Lane::Low.index()] {
        Some(Lane::Low)
    } else {
        None
    }
}

impl KernelState {
    /// The scheduling rank of a thread: its priority's rank, except the idle
    /// thread which ranks below everything.
    pub(crate) fn rank_of(&self, thread: ThreadId) -> u8 {
        if thread == IDLE_THREAD {
            0
        } else {
            self.thread(thread).map(|t| t.prio.rank()).unwrap_or(0)
        }
    }

    /// Picks the thread to dispatch next, updating states and queues.
    /// Returns `(prev, next)`, or `None` when the current thread keeps the
    /// processor.
    pub(crate) fn pick_next(&mut self) -> Option<(ThreadId, ThreadId)> {
        let cur = self.cur_thread;
        let cur_running = self
            .thread(cur)
            .map(|t| t.state == ThreadState::Running)
            .unwrap_or(false);

        let next = if cur_running {
            let rank = self.rank_of(cur);
            let lane = preempt_lane(rank, self.ready.occupancy())?;
            let next = self.ready.pop(lane).expect("occupied lane had no head");
            let prio = self.thread(cur).expect("running thread gone").prio;
            self.thread_mut(cur).expect("running thread gone").state = ThreadState::Ready;
            self.ready.enqueue(prio, cur);
            next
        } else {
            // The current thread blocked, died, or yielded; take the highest
            // head, or fall back to the idle thread.
            let next = self.ready.pop_first().unwrap_or(IDLE_THREAD);
            if next == cur {
                // A yielding thread alone in its lane popped itself.
                self.thread_mut(cur).expect("current thread gone").state = ThreadState::Running;
                return None;
            }
            next
        };

        self.cur_thread = next;
        self.thread_mut(next).expect("dispatched a deleted thread").state = ThreadState::Running;
        Some((cur, next))
    }

    pub(crate) fn context_of(&self, thread: ThreadId) -> vmk_machine::ContextId {
        self.thread(thread)
            .and_then(|t| t.context)
            .expect("dispatched thread has no context")
    }
}

/// Runs one scheduling pass and performs the resulting context switch, if
/// any. Must be called with interrupts masked (or from an interrupt handler)
/// and with no state borrow outstanding.
pub(crate) fn schedule(shared: &KernelShared) {
    let switch = {
        let mut st = shared.state.lock();
        st.pick_next().map(|(prev, next)| {
            log::trace!("schedule: dispatch {} (from {})", next, prev);
            (st.context_of(prev), st.context_of(next))
        })
    };
    if let Some((prev, next)) = switch {
        shared.machine.context_switch(prev, next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ThreadCb;
    use crate::mutex::MutexCb;

    fn state_with(threads: Vec<Option<ThreadCb>>, cur: ThreadId) -> KernelState {
        KernelState {
            cur_thread: cur,
            tick_count: 0,
            threads,
            ready: ReadyQueues::default(),
            sleepers: Vec::new(),
            mutexes: Vec::new(),
            pools: Vec::new(),
            next_pool_id: 2,
            shared_mutex: MutexCb::new(),
        }
    }

    fn tcb(prio: Priority, state: ThreadState) -> Option<ThreadCb> {
        let mut cb = ThreadCb::idle_or_main(prio);
        cb.state = state;
        Some(cb)
    }

    #[test]
    fn preemption_chain_is_rank_gated() {
        let hi = [true, false, false];
        let no = [false, true, false];
        let lo = [false, false, true];
        let all = [true, true, true];
        let none = [false, false, false];

        // HIGH preempts everyone, its own rank included.
        assert_eq!(preempt_lane(3, hi), Some(Lane::High));
        assert_eq!(preempt_lane(2, hi), Some(Lane::High));
        assert_eq!(preempt_lane(0, all), Some(Lane::High));

        // NORMAL preempts its own rank and below, never a HIGH runner.
        assert_eq!(preempt_lane(3, no), None);
        assert_eq!(preempt_lane(2, no), Some(Lane::Normal));
        assert_eq!(preempt_lane(1, no), Some(Lane::Normal));

        // LOW preempts its own rank and the idle rank.
        assert_eq!(preempt_lane(2, lo), None);
        assert_eq!(preempt_lane(1, lo), Some(Lane::Low));
        assert_eq!(preempt_lane(0, lo), Some(Lane::Low));

        assert_eq!(preempt_lane(0, none), None);
    }

    #[test]
    fn equal_priority_round_robin_rotates_the_lane() {
        let mut st = state_with(
            vec![
                tcb(Priority::Low, ThreadState::Ready),
                tcb(Priority::Normal, ThreadState::Running),
                tcb(Priority::Normal, ThreadState::Ready),
            ],
            1,
        );
        st.ready.enqueue(Priority::Normal, 2);

        assert_eq!(st.pick_next(), Some((1, 2)));
        assert_eq!(st.cur_thread, 2);
        // The preempted thread went to the tail, so the next pass brings it
        // back.
        assert_eq!(st.pick_next(), Some((2, 1)));
    }

    #[test]
    fn lower_priority_does_not_preempt() {
        let mut st = state_with(
            vec![
                tcb(Priority::Low, ThreadState::Ready),
                tcb(Priority::High, ThreadState::Running),
                tcb(Priority::Normal, ThreadState::Ready),
            ],
            1,
        );
        st.ready.enqueue(Priority::Normal, 2);
        assert_eq!(st.pick_next(), None);
        assert_eq!(st.cur_thread, 1);
    }

    #[test]
    fn blocked_current_falls_back_to_idle() {
        let mut st = state_with(
            vec![
                tcb(Priority::Low, ThreadState::Ready),
                tcb(Priority::Normal, ThreadState::Waiting),
            ],
            1,
        );
        assert_eq!(st.pick_next(), Some((1, IDLE_THREAD)));
        assert_eq!(st.cur_thread, IDLE_THREAD);
        assert_eq!(
            st.thread(IDLE_THREAD).unwrap().state,
            ThreadState::Running,
        );
    }

    #[test]
    fn preempted_idle_is_not_requeued() {
        let mut st = state_with(
            vec![
                tcb(Priority::Low, ThreadState::Running),
                tcb(Priority::Normal, ThreadState::Ready),
            ],
            IDLE_THREAD,
        );
        st.ready.enqueue(Priority::Normal, 1);
        assert_eq!(st.pick_next(), Some((IDLE_THREAD, 1)));
        // Idle went READY but not into any lane.
        assert_eq!(st.ready.occupancy(), [false, false, false]);
        assert_eq!(st.thread(IDLE_THREAD).unwrap().state, ThreadState::Ready);
    }

    #[test]
    fn yielding_alone_keeps_running() {
        let mut st = state_with(
            vec![
                tcb(Priority::Low, ThreadState::Ready),
                tcb(Priority::Normal, ThreadState::Ready),
            ],
            1,
        );
        st.ready.enqueue(Priority::Normal, 1);
        assert_eq!(st.pick_next(), None);
        assert_eq!(st.cur_thread, 1);
        assert_eq!(st.thread(1).unwrap().state, ThreadState::Running);
        assert_eq!(st.ready.occupancy(), [false, false, false]);
    }
}
