//! Interrupt masking for the public operations.
//!
//! Every public operation masks interrupts for its whole duration by holding
//! a [`MaskGuard`]. Internal routines never mask on their own; they run under
//! the caller's guard (or under the interrupt gate when called from a tick or
//! completion handler).
use crate::Kernel;

pub(crate) struct MaskGuard<'a> {
    kernel: &'a Kernel,
}

impl Kernel {
    pub(crate) fn mask(&self) -> MaskGuard<'_> {
        self.shared.machine.critical_enter();
        MaskGuard { kernel: self }
    }
}

impl Drop for MaskGuard<'_> {
    fn drop(&mut self) {
        self.kernel.shared.machine.critical_exit();
    }
}
