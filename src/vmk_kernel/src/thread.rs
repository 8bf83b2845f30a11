//! Thread objects and their lifecycle operations.
use std::sync::Arc;

use crate::error::{
    ActivateThreadError, CreateThreadError, DeleteThreadError, QueryThreadError, SleepError,
    TerminateThreadError,
};
use crate::mutex::{self, MutexRef};
use crate::sched::{self, Lane};
use crate::{
    Kernel, KernelState, ThreadId, Tick, SYSTEM_POOL_ID, TIMEOUT_IMMEDIATE, TIMEOUT_INFINITE,
};

/// Scheduling priority of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    /// Numeric rank used in preemption comparisons. The idle thread sits
    /// below `Low` and has no priority of its own.
    pub(crate) fn rank(self) -> u8 {
        match self {
            Priority::Low => 1,
            Priority::Normal => 2,
            Priority::High => 3,
        }
    }

    pub(crate) fn lane(self) -> Lane {
        match self {
            Priority::Low => Lane::Low,
            Priority::Normal => Lane::Normal,
            Priority::High => Lane::High,
        }
    }
}

/// Lifecycle state of a thread.
///
/// A deleted slot has no state at all; its id is simply invalid until a new
/// thread reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Created (or terminated) but not activated.
    Dead,
    /// Runnable, queued in its priority's lane.
    Ready,
    /// The one thread the processor currently belongs to.
    Running,
    /// Blocked: sleeping, acquiring a mutex, or waiting out a file
    /// operation.
    Waiting,
}

/// Entry point of a thread. Receives a handle to the runtime it lives in and
/// the parameter given at creation.
pub type ThreadEntry = fn(&Kernel, usize);

pub(crate) struct ThreadCb {
    pub(crate) entry: Option<ThreadEntry>,
    pub(crate) param: usize,
    pub(crate) stack_addr: usize,
    pub(crate) stack_size: usize,
    pub(crate) context: Option<vmk_machine::ContextId>,
    pub(crate) state: ThreadState,
    pub(crate) prio: Priority,
    /// Result of the file operation this thread last waited out.
    pub(crate) wait_result: i32,
    /// Ticks left until wake while in the sleep set.
    pub(crate) sleep_ticks: Tick,
    /// The mutex this thread is queued on while WAITING for one.
    pub(crate) waiting_mutex: Option<MutexRef>,
}

impl ThreadCb {
    pub(crate) fn new(
        entry: ThreadEntry,
        param: usize,
        stack_addr: usize,
        stack_size: usize,
        prio: Priority,
    ) -> Self {
        Self {
            entry: Some(entry),
            param,
            stack_addr,
            stack_size,
            context: None,
            state: ThreadState::Dead,
            prio,
            wait_result: 0,
            sleep_ticks: 0,
            waiting_mutex: None,
        }
    }

    /// Control block for the two boot-time threads, which have no entry of
    /// their own.
    pub(crate) fn idle_or_main(prio: Priority) -> Self {
        Self {
            entry: None,
            param: 0,
            stack_addr: 0,
            stack_size: 0,
            context: None,
            state: ThreadState::Dead,
            prio,
            wait_result: 0,
            sleep_ticks: 0,
            waiting_mutex: None,
        }
    }
}

impl KernelState {
    pub(crate) fn thread(&self, id: ThreadId) -> Option<&ThreadCb> {
        self.threads.get(id)?.as_ref()
    }

    pub(crate) fn thread_mut(&mut self, id: ThreadId) -> Option<&mut ThreadCb> {
        self.threads.get_mut(id)?.as_mut()
    }

    /// Every mutex `thread` currently holds, the internal shared-region
    /// mutex included.
    fn mutexes_held_by(&self, thread: ThreadId) -> Vec<MutexRef> {
        let mut held: Vec<MutexRef> = self
            .mutexes
            .iter()
            .enumerate()
            .filter_map(|(i, m)| match m {
                Some(m) if m.owner == Some(thread) => Some(MutexRef::Table(i)),
                _ => None,
            })
            .collect();
        if self.shared_mutex.owner == Some(thread) {
            held.push(MutexRef::SharedRegion);
        }
        held
    }
}

impl Kernel {
    /// Creates a thread in the DEAD state. The stack comes out of the system
    /// pool. Slots of deleted threads (other than the two boot slots) are
    /// reused, lowest first.
    pub fn thread_create(
        &self,
        entry: ThreadEntry,
        param: usize,
        stack_size: usize,
        prio: Priority,
    ) -> Result<ThreadId, CreateThreadError> {
        let _mask = self.mask();
        if stack_size == 0 {
            return Err(CreateThreadError::InvalidParameter);
        }
        let mut st = self.shared.state.lock();
        let stack_addr = st
            .pool_mut(SYSTEM_POOL_ID)
            .expect("system pool missing")
            .allocate(stack_size)
            .ok_or(CreateThreadError::InsufficientResources)?;

        let cb = ThreadCb::new(entry, param, stack_addr, stack_size, prio);
        let id = match (2..st.threads.len()).find(|&i| st.threads[i].is_none()) {
            Some(i) => {
                st.threads[i] = Some(cb);
                i
            }
            None => {
                st.threads.push(Some(cb));
                st.threads.len() - 1
            }
        };
        log::trace!("thread_create: id {} prio {:?} stack {}", id, prio, stack_size);
        Ok(id)
    }

    /// Makes a DEAD thread READY and enqueues it. If it outranks the caller,
    /// the scheduler runs before this returns.
    pub fn thread_activate(&self, thread: ThreadId) -> Result<(), ActivateThreadError> {
        let _mask = self.mask();

        let (stack_size, old_context) = {
            let mut st = self.shared.state.lock();
            let tcb = st.thread(thread).ok_or(ActivateThreadError::InvalidId)?;
            if tcb.state != ThreadState::Dead {
                return Err(ActivateThreadError::InvalidState);
            }
            let stack_size = tcb.stack_size;
            let old = st.thread_mut(thread).expect("checked above").context.take();
            (stack_size, old)
        };
        // A terminated thread being reactivated still has its old, spent
        // context; replace it.
        if let Some(old) = old_context {
            self.shared.machine.context_destroy(old);
        }

        let shared = Arc::clone(&self.shared);
        let context = self
            .shared
            .machine
            .context_create(move || crate::thread_skeleton(shared, thread), stack_size);

        let preempt = {
            let mut st = self.shared.state.lock();
            let cur = st.cur_thread;
            let prio = {
                let tcb = st.thread_mut(thread).expect("activated thread vanished");
                tcb.context = Some(context);
                tcb.state = ThreadState::Ready;
                tcb.prio
            };
            st.ready.enqueue(prio, thread);
            prio.rank() > st.rank_of(cur)
        };
        log::trace!("thread_activate: id {}", thread);
        if preempt {
            sched::schedule(&self.shared);
        }
        Ok(())
    }

    /// Kills a thread whatever it is doing: it is pulled out of the ready
    /// lane, the sleep set, and any mutex wait queue it is still queued on,
    /// and every mutex it holds is released as if by the caller.
    pub fn thread_terminate(&self, thread: ThreadId) -> Result<(), TerminateThreadError> {
        let _mask = self.mask();
        {
            let mut st = self.shared.state.lock();
            let (state, prio, waiting) = {
                let tcb = st.thread(thread).ok_or(TerminateThreadError::InvalidId)?;
                (tcb.state, tcb.prio, tcb.waiting_mutex)
            };
            match state {
                ThreadState::Dead => return Err(TerminateThreadError::InvalidState),
                ThreadState::Ready => st.ready.remove(prio, thread),
                ThreadState::Waiting => st.sleepers.retain(|&t| t != thread),
                ThreadState::Running => {}
            }
            // A timed waiter whose timeout already expired is READY with its
            // wait-lane entry still queued until it next runs, so the purge
            // keys on the recorded mutex, not the state.
            if let Some(mref) = waiting {
                if let Some(m) = st.mutex_mut(mref) {
                    m.remove_waiter(prio, thread);
                }
            }

            {
                let tcb = st.thread_mut(thread).expect("checked above");
                tcb.state = ThreadState::Dead;
                tcb.sleep_ticks = 0;
                tcb.waiting_mutex = None;
            }

            for mref in st.mutexes_held_by(thread) {
                let woken = mutex::release_core(&mut st, mref);
                log::trace!(
                    "thread_terminate: {} dropped {:?} (woke {:?})",
                    thread,
                    mref,
                    woken,
                );
            }
        }
        log::trace!("thread_terminate: id {}", thread);
        sched::schedule(&self.shared);
        Ok(())
    }

    /// Frees a DEAD thread's slot and stack. The slot's id becomes invalid
    /// until reused by a later create.
    pub fn thread_delete(&self, thread: ThreadId) -> Result<(), DeleteThreadError> {
        let _mask = self.mask();
        let context = {
            let mut st = self.shared.state.lock();
            let tcb = st.thread(thread).ok_or(DeleteThreadError::InvalidId)?;
            if tcb.state != ThreadState::Dead {
                return Err(DeleteThreadError::InvalidState);
            }
            let stack_addr = tcb.stack_addr;
            let context = tcb.context;
            if stack_addr != 0 {
                let freed = st
                    .pool_mut(SYSTEM_POOL_ID)
                    .expect("system pool missing")
                    .deallocate(stack_addr);
                if !freed {
                    log::warn!("thread_delete: stack of {} was not in the system pool", thread);
                }
            }
            st.threads[thread] = None;
            context
        };
        if let Some(context) = context {
            self.shared.machine.context_destroy(context);
        }
        log::trace!("thread_delete: id {}", thread);
        Ok(())
    }

    /// Puts the calling thread to sleep for `ticks` tick interrupts. Zero
    /// ([`TIMEOUT_IMMEDIATE`]) yields the processor instead;
    /// [`TIMEOUT_INFINITE`] is refused, as nothing would ever wake the
    /// sleeper.
    pub fn thread_sleep(&self, ticks: Tick) -> Result<(), SleepError> {
        let _mask = self.mask();
        if ticks == TIMEOUT_INFINITE {
            return Err(SleepError::InvalidParameter);
        }
        {
            let mut st = self.shared.state.lock();
            let cur = st.cur_thread;
            if ticks == TIMEOUT_IMMEDIATE {
                let prio = st.thread(cur).expect("no current thread").prio;
                st.thread_mut(cur).expect("no current thread").state = ThreadState::Ready;
                st.ready.enqueue(prio, cur);
                log::trace!("thread_sleep: {} yields", cur);
            } else {
                let tcb = st.thread_mut(cur).expect("no current thread");
                tcb.state = ThreadState::Waiting;
                tcb.sleep_ticks = ticks;
                st.sleepers.push(cur);
                log::trace!("thread_sleep: {} for {} ticks", cur, ticks);
            }
        }
        sched::schedule(&self.shared);
        Ok(())
    }

    /// The lifecycle state of a thread.
    pub fn thread_state(&self, thread: ThreadId) -> Result<ThreadState, QueryThreadError> {
        let _mask = self.mask();
        let st = self.shared.state.lock();
        st.thread(thread)
            .map(|t| t.state)
            .ok_or(QueryThreadError::InvalidId)
    }

    /// The id of the calling thread.
    pub fn current_thread(&self) -> ThreadId {
        let _mask = self.mask();
        self.shared.state.lock().cur_thread
    }
}
