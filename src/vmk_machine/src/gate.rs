//! The interrupt gate.
//!
//! The gate plays the role the signal mask plays on a real machine: program
//! code runs with the gate free, a context masks interrupts by acquiring the
//! gate, and interrupt handlers run holding it. Ownership is handed from a
//! switched-out context (or an exiting interrupt) directly to the context
//! being dispatched, so a context always finds itself the owner when it wakes
//! from a park.
use spin::Mutex as SpinMutex;
use std::{sync::Arc, thread};

use crate::threading::{self, ContextData};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GateOwner {
    Free,
    Context(usize),
    Interrupt,
}

struct GateSt {
    owner: GateOwner,
    /// Context to dispatch when the current interrupt finishes.
    pending: Option<Arc<ContextData>>,
}

pub(crate) struct Gate {
    st: SpinMutex<GateSt>,
}

impl Gate {
    pub(crate) fn new() -> Self {
        Self {
            st: SpinMutex::new(GateSt {
                owner: GateOwner::Free,
                pending: None,
            }),
        }
    }

    pub(crate) fn owner(&self) -> GateOwner {
        self.st.lock().owner
    }

    /// Acquires the gate for a context, waiting out any current owner.
    ///
    /// A remote park signal landing while the spin lock is held is deferred
    /// by the handler; this function honors the deferral at the first
    /// lock-free point. Being dispatched while still waiting here makes the
    /// context the owner without its knowledge, so after any park the gate is
    /// released and the attempt restarted.
    pub(crate) fn acquire_context(&self, data: &ContextData) {
        loop {
            data.begin_gate_op();
            let acquired = {
                let mut st = self.st.lock();
                match st.owner {
                    GateOwner::Free => {
                        st.owner = GateOwner::Context(data.slot());
                        true
                    }
                    GateOwner::Context(slot) => {
                        assert_ne!(slot, data.slot(), "context reacquired the gate");
                        false
                    }
                    GateOwner::Interrupt => false,
                }
            };
            data.end_gate_op();
            if data.take_deferred_park() {
                debug_assert!(!acquired);
                threading::park_for_dispatch(data);
                self.release_context(data);
                continue;
            }
            if acquired {
                return;
            }
            thread::yield_now();
        }
    }

    /// Releases the gate if (and only if) `data` owns it. A context unwound
    /// while parked never owns the gate, so its guards release nothing.
    pub(crate) fn release_context(&self, data: &ContextData) {
        let mut st = self.st.lock();
        if st.owner == GateOwner::Context(data.slot()) {
            st.owner = GateOwner::Free;
        }
    }

    /// Hands ownership to the context about to be dispatched. The caller must
    /// own the gate.
    pub(crate) fn transfer_to(&self, data: &ContextData) {
        self.st.lock().owner = GateOwner::Context(data.slot());
    }

    pub(crate) fn interrupt_enter(&self) {
        loop {
            {
                let mut st = self.st.lock();
                if st.owner == GateOwner::Free {
                    st.owner = GateOwner::Interrupt;
                    return;
                }
            }
            thread::yield_now();
        }
    }

    /// Records the context to dispatch when the interrupt finishes. At most
    /// one dispatch per interrupt.
    pub(crate) fn set_pending_dispatch(&self, next: Arc<ContextData>) {
        let mut st = self.st.lock();
        debug_assert_eq!(st.owner, GateOwner::Interrupt);
        debug_assert!(st.pending.is_none());
        st.pending = Some(next);
    }

    /// Leaves the interrupt, handing the gate to the pending context if a
    /// dispatch was requested.
    pub(crate) fn interrupt_exit(&self) {
        let pending = {
            let mut st = self.st.lock();
            debug_assert_eq!(st.owner, GateOwner::Interrupt);
            let pending = st.pending.take();
            st.owner = match &pending {
                Some(next) => GateOwner::Context(next.slot()),
                None => GateOwner::Free,
            };
            pending
        };
        if let Some(next) = pending {
            next.unpark();
        }
    }
}
