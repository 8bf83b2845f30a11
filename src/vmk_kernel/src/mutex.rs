//! Mutexes: priority-ordered wait queues with direct hand-off.
//!
//! A release never leaves a contended mutex unlocked: ownership moves
//! straight to the chosen waiter, so no lower-priority thread can slip in
//! between. Waiters time out by sitting in the sleep set as well; whichever
//! of grant and expiry reaches the thread first wins, and the loser's queue
//! entry is discarded as stale.
use std::collections::VecDeque;

use crate::error::{AcquireMutexError, DeleteMutexError, QueryMutexError, ReleaseMutexError};
use crate::sched::{self, Lane};
use crate::thread::{Priority, ThreadState};
use crate::{Kernel, KernelState, MutexId, ThreadId, Tick, TIMEOUT_IMMEDIATE, TIMEOUT_INFINITE};

/// Which mutex a wait refers to: one from the public table, or the internal
/// one serializing the shared I/O region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MutexRef {
    Table(MutexId),
    SharedRegion,
}

#[derive(Debug)]
pub(crate) struct MutexCb {
    pub(crate) owner: Option<ThreadId>,
    wait_lanes: [VecDeque<ThreadId>; 3],
}

impl MutexCb {
    pub(crate) fn new() -> Self {
        Self {
            owner: None,
            wait_lanes: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
        }
    }

    fn enqueue_waiter(&mut self, prio: Priority, thread: ThreadId) {
        self.wait_lanes[prio.lane().index()].push_back(thread);
    }

    fn pop_waiter(&mut self, lane: Lane) -> Option<ThreadId> {
        self.wait_lanes[lane.index()].pop_front()
    }

    pub(crate) fn remove_waiter(&mut self, prio: Priority, thread: ThreadId) {
        self.wait_lanes[prio.lane().index()].retain(|&t| t != thread);
    }
}

impl KernelState {
    pub(crate) fn mutex(&self, mref: MutexRef) -> Option<&MutexCb> {
        match mref {
            MutexRef::Table(id) => self.mutexes.get(id)?.as_ref(),
            MutexRef::SharedRegion => Some(&self.shared_mutex),
        }
    }

    pub(crate) fn mutex_mut(&mut self, mref: MutexRef) -> Option<&mut MutexCb> {
        match mref {
            MutexRef::Table(id) => self.mutexes.get_mut(id)?.as_mut(),
            MutexRef::SharedRegion => Some(&mut self.shared_mutex),
        }
    }
}

/// Hands the mutex to its next waiter, or unlocks it.
///
/// Lanes are scanned HIGH to LOW, FIFO within each. Entries whose thread is
/// no longer WAITING for this mutex (its timeout expired, or it was
/// terminated) are discarded on the way. The woken thread becomes the owner
/// and goes READY; the caller decides whether that warrants a reschedule.
pub(crate) fn release_core(st: &mut KernelState, mref: MutexRef) -> Option<ThreadId> {
    let mut woken = None;
    'lanes: for lane in Lane::ALL {
        loop {
            let candidate = match st.mutex_mut(mref).expect("released mutex vanished").pop_waiter(lane) {
                Some(t) => t,
                None => break,
            };
            let live = st
                .thread(candidate)
                .map(|t| t.state == ThreadState::Waiting && t.waiting_mutex == Some(mref))
                .unwrap_or(false);
            if live {
                woken = Some(candidate);
                break 'lanes;
            }
            log::trace!("release: discarding stale waiter {}", candidate);
        }
    }

    match woken {
        Some(thread) => {
            st.sleepers.retain(|&t| t != thread);
            let prio = st.thread(thread).expect("woken thread vanished").prio;
            {
                let tcb = st.thread_mut(thread).expect("woken thread vanished");
                tcb.state = ThreadState::Ready;
                tcb.waiting_mutex = None;
                tcb.sleep_ticks = 0;
            }
            st.mutex_mut(mref).expect("released mutex vanished").owner = Some(thread);
            st.ready.enqueue(prio, thread);
        }
        None => {
            st.mutex_mut(mref).expect("released mutex vanished").owner = None;
        }
    }
    woken
}

/// Tries to take the mutex for the calling thread, blocking up to `timeout`
/// ticks. Returns whether the caller owns the mutex afterwards.
///
/// The caller must have masked interrupts and validated `mref`.
pub(crate) fn acquire_core(kernel: &Kernel, mref: MutexRef, timeout: Tick) -> bool {
    {
        let mut st = kernel.shared.state.lock();
        let cur = st.cur_thread;
        let m = st.mutex_mut(mref).expect("acquired mutex vanished");
        match m.owner {
            None => {
                m.owner = Some(cur);
                return true;
            }
            Some(owner) if owner == cur => return false,
            Some(_) => {}
        }
        if timeout == TIMEOUT_IMMEDIATE {
            return false;
        }

        let prio = st.thread(cur).expect("no current thread").prio;
        st.mutex_mut(mref)
            .expect("acquired mutex vanished")
            .enqueue_waiter(prio, cur);
        {
            let tcb = st.thread_mut(cur).expect("no current thread");
            tcb.state = ThreadState::Waiting;
            tcb.waiting_mutex = Some(mref);
            if timeout != TIMEOUT_INFINITE {
                tcb.sleep_ticks = timeout;
            }
        }
        if timeout != TIMEOUT_INFINITE {
            st.sleepers.push(cur);
        }
    }
    sched::schedule(&kernel.shared);

    // Dispatched again: either the release handed us the mutex, or the
    // timeout expired first.
    let mut st = kernel.shared.state.lock();
    let cur = st.cur_thread;
    let owned = st
        .mutex(mref)
        .map(|m| m.owner == Some(cur))
        .unwrap_or(false);
    if !owned {
        let prio = st.thread(cur).expect("no current thread").prio;
        if let Some(m) = st.mutex_mut(mref) {
            m.remove_waiter(prio, cur);
        }
        st.thread_mut(cur).expect("no current thread").waiting_mutex = None;
    }
    owned
}

/// Releases `mref` on behalf of the current thread and reschedules if the
/// woken waiter outranks it.
pub(crate) fn release_with_resched(kernel: &Kernel, mref: MutexRef) {
    let need_resched = {
        let mut st = kernel.shared.state.lock();
        let cur = st.cur_thread;
        match release_core(&mut st, mref) {
            Some(woken) => st.rank_of(woken) > st.rank_of(cur),
            None => false,
        }
    };
    if need_resched {
        sched::schedule(&kernel.shared);
    }
}

impl Kernel {
    /// Creates an unlocked mutex, reusing the lowest tombstoned slot if one
    /// exists.
    pub fn mutex_create(&self) -> MutexId {
        let _mask = self.mask();
        let mut st = self.shared.state.lock();
        let id = match (0..st.mutexes.len()).find(|&i| st.mutexes[i].is_none()) {
            Some(i) => {
                st.mutexes[i] = Some(MutexCb::new());
                i
            }
            None => {
                st.mutexes.push(Some(MutexCb::new()));
                st.mutexes.len() - 1
            }
        };
        log::trace!("mutex_create: id {}", id);
        id
    }

    /// Deletes an unlocked mutex, tombstoning its slot.
    pub fn mutex_delete(&self, mutex: MutexId) -> Result<(), DeleteMutexError> {
        let _mask = self.mask();
        let mut st = self.shared.state.lock();
        let m = st
            .mutex(MutexRef::Table(mutex))
            .ok_or(DeleteMutexError::InvalidId)?;
        if m.owner.is_some() {
            return Err(DeleteMutexError::InvalidState);
        }
        st.mutexes[mutex] = None;
        log::trace!("mutex_delete: id {}", mutex);
        Ok(())
    }

    /// Acquires a mutex, blocking for at most `timeout` ticks.
    /// [`TIMEOUT_IMMEDIATE`] never blocks; [`TIMEOUT_INFINITE`] never gives
    /// up.
    pub fn mutex_acquire(&self, mutex: MutexId, timeout: Tick) -> Result<(), AcquireMutexError> {
        let _mask = self.mask();
        {
            let st = self.shared.state.lock();
            st.mutex(MutexRef::Table(mutex))
                .ok_or(AcquireMutexError::InvalidId)?;
        }
        log::trace!("mutex_acquire: id {} timeout {}", mutex, timeout);
        if acquire_core(self, MutexRef::Table(mutex), timeout) {
            Ok(())
        } else {
            Err(AcquireMutexError::Failure)
        }
    }

    /// Releases a mutex the calling thread holds, handing it to the next
    /// waiter if any.
    pub fn mutex_release(&self, mutex: MutexId) -> Result<(), ReleaseMutexError> {
        let _mask = self.mask();
        let need_resched = {
            let mut st = self.shared.state.lock();
            let cur = st.cur_thread;
            let m = st
                .mutex(MutexRef::Table(mutex))
                .ok_or(ReleaseMutexError::InvalidId)?;
            if m.owner != Some(cur) {
                return Err(ReleaseMutexError::InvalidState);
            }
            match release_core(&mut st, MutexRef::Table(mutex)) {
                Some(woken) => st.rank_of(woken) > st.rank_of(cur),
                None => false,
            }
        };
        log::trace!("mutex_release: id {}", mutex);
        if need_resched {
            sched::schedule(&self.shared);
        }
        Ok(())
    }

    /// The current owner of a mutex, or `None` while it is unlocked.
    pub fn mutex_owner(&self, mutex: MutexId) -> Result<Option<ThreadId>, QueryMutexError> {
        let _mask = self.mask();
        let st = self.shared.state.lock();
        st.mutex(MutexRef::Table(mutex))
            .map(|m| m.owner)
            .ok_or(QueryMutexError::InvalidId)
    }
}
