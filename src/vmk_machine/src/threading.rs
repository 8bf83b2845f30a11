//! Simulated execution contexts backed by native threads.
//!
//! Each context owns a counting park token implemented by a socket pair. A
//! context that is not dispatched sits in `recv` on its token; dispatching it
//! sends one byte. Contexts preempted while running are parked remotely from
//! a signal handler so that at most one context executes program code at any
//! instant.
use spin::Mutex as SpinMutex;
use std::{
    os::raw::c_int,
    panic::{self, AssertUnwindSafe},
    ptr::null_mut,
    sync::{
        atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering},
        Arc, Once,
    },
    thread,
};

use crate::gate::Gate;

/// Signal used to park a context from outside its own thread.
const SIGNAL_REMOTE_PARK: c_int = libc::SIGUSR1;

/// Native threads refuse to start on stacks smaller than this, so requested
/// stack sizes are clamped before reaching `std::thread::Builder`.
const MIN_NATIVE_STACK: usize = 64 * 1024;

pub(crate) type ContextBody = Box<dyn FnOnce() + Send + 'static>;

/// Per-context bookkeeping shared between the context's native thread, the
/// dispatcher, and the remote-park signal handler.
pub(crate) struct ContextData {
    slot: usize,
    gate: Arc<Gate>,
    /// `park_sock[0]` is the receiving (parking) end.
    park_sock: [c_int; 2],
    pthread: AtomicUsize,
    defunct: AtomicBool,
    /// Set once the context is guaranteed to execute no more program code
    /// until its next dispatch. The remote-park requester spins on this.
    remote_parked: AtomicBool,
    /// `true` while the context's own thread holds the gate's spin lock.
    /// The signal handler must not park in that window.
    in_gate_op: AtomicBool,
    deferred_park: AtomicBool,
}

impl ContextData {
    fn new(slot: usize, gate: Arc<Gate>) -> Self {
        let mut fds = [0 as c_int; 2];
        ok_or_errno(unsafe {
            libc::socketpair(libc::PF_LOCAL, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        })
        .unwrap();

        Self {
            slot,
            gate,
            park_sock: fds,
            pthread: AtomicUsize::new(0),
            defunct: AtomicBool::new(false),
            remote_parked: AtomicBool::new(false),
            in_gate_op: AtomicBool::new(false),
            deferred_park: AtomicBool::new(false),
        }
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    fn register_current_pthread(&self) {
        self.pthread
            .store(unsafe { libc::pthread_self() } as usize, Ordering::Release);
    }

    /// Sends one dispatch token. Exactly one `park` returns per token sent.
    pub(crate) fn unpark(&self) {
        let buf = 0u8;
        isize_ok_or_errno(unsafe {
            libc::send(self.park_sock[1], &buf as *const u8 as *const _, 1, 0)
        })
        .unwrap();
    }

    pub(crate) fn mark_defunct(&self) {
        self.defunct.store(true, Ordering::Release);
        self.unpark();
    }

    pub(crate) fn is_defunct(&self) -> bool {
        self.defunct.load(Ordering::Acquire)
    }

    pub(crate) fn begin_gate_op(&self) {
        self.in_gate_op.store(true, Ordering::Relaxed);
    }

    pub(crate) fn end_gate_op(&self) {
        self.in_gate_op.store(false, Ordering::Relaxed);
    }

    pub(crate) fn take_deferred_park(&self) -> bool {
        self.deferred_park.swap(false, Ordering::Relaxed)
    }
}

impl Drop for ContextData {
    fn drop(&mut self) {
        for &fd in self.park_sock.iter() {
            let _ = unsafe { libc::close(fd) };
        }
    }
}

/// Unwind payload used to dismantle a defunct context's native thread.
struct ExitToken;

thread_local! {
    static SELF_CONTEXT: once_cell::unsync::OnceCell<Arc<ContextData>> =
        once_cell::unsync::OnceCell::new();
}

fn register_self(data: &Arc<ContextData>) {
    data.register_current_pthread();
    SELF_CONTEXT.with(|cell| {
        cell.set(Arc::clone(data))
            .map_err(|_| ())
            .unwrap();
    });
}

/// The context the calling native thread embodies, if any.
pub(crate) fn with_current<R>(f: impl FnOnce(&Arc<ContextData>) -> R) -> Option<R> {
    SELF_CONTEXT.with(|cell| cell.get().map(f))
}

/// Spawns a parked context thread. `body` runs when the context is first
/// dispatched; if it ever returns, the thread parks until the context is
/// destroyed. Does not return before the child thread is ready to be
/// remotely parked.
pub(crate) fn spawn_context(gate: Arc<Gate>, slot: usize, body: ContextBody, stack_size: usize) -> Arc<ContextData> {
    let data = Arc::new(ContextData::new(slot, gate));
    let data2 = Arc::clone(&data);
    let parent_thread = thread::current();

    thread::Builder::new()
        .name(format!("vmk context {}", slot))
        .stack_size(stack_size.max(MIN_NATIVE_STACK))
        .spawn(move || {
            register_self(&data2);
            parent_thread.unpark();

            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                park_for_dispatch(&data2);
                body();
                // The body returned; hold the thread here until the context
                // is destroyed.
                loop {
                    park_for_dispatch(&data2);
                }
            }));
            match result {
                Ok(()) => {}
                Err(payload) if payload.is::<ExitToken>() => {}
                Err(payload) => panic::resume_unwind(payload),
            }
        })
        .unwrap();

    // Wait for the child to publish its pthread identity.
    thread::park();

    data
}

/// Registers the calling thread as a context. Used for the thread that booted
/// the runtime, which has no trampoline of its own.
pub(crate) fn adopt_current(gate: Arc<Gate>, slot: usize) -> Arc<ContextData> {
    let data = Arc::new(ContextData::new(slot, gate));
    register_self(&data);
    data
}

/// Blocks until one dispatch token arrives.
fn park_raw(data: &ContextData) {
    let mut buf = 0u8;
    loop {
        match isize_ok_or_errno(unsafe {
            libc::recv(data.park_sock[0], &mut buf as *mut u8 as *mut _, 1, 0)
        }) {
            Ok(1) => return,
            Ok(_) => {}
            Err(e) if e.0 == libc::EINTR || e.0 == libc::EAGAIN => {}
            Err(e) => panic!("failed to park the thread: {}", e),
        }
    }
}

/// Parks until dispatched. Unwinds instead of returning if the context was
/// destroyed while parked, so the native thread can dismantle itself.
pub(crate) fn park_for_dispatch(data: &ContextData) {
    park_raw(data);
    if data.is_defunct() {
        panic::resume_unwind(Box::new(ExitToken));
    }
}

static PARK_TARGET: AtomicPtr<ContextData> = AtomicPtr::new(null_mut());

/// Serializes remote parks across machine instances. Within one instance the
/// interrupt-owned gate already does this, but nothing else keeps two
/// instances in separate tests from racing on `PARK_TARGET`.
static REMOTE_PARK_LOCK: SpinMutex<()> = SpinMutex::new(());

/// Parks `data`'s thread from outside. May only be called while the gate is
/// interrupt-owned, which serializes all remote parks. On return the target
/// executes no more program code until its next dispatch.
pub(crate) fn remote_park(data: &Arc<ContextData>) {
    static HANDLER: Once = Once::new();
    HANDLER.call_once(|| {
        let handler: extern "C" fn(c_int, *mut libc::siginfo_t, *mut libc::c_void) =
            remote_park_signal_handler;
        let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
        sa.sa_sigaction = handler as usize;
        sa.sa_flags = libc::SA_SIGINFO;
        unsafe { libc::sigemptyset(&mut sa.sa_mask) };
        ok_or_errno(unsafe { libc::sigaction(SIGNAL_REMOTE_PARK, &sa, null_mut()) }).unwrap();
    });

    let _protocol = REMOTE_PARK_LOCK.lock();

    data.remote_parked.store(false, Ordering::Relaxed);
    PARK_TARGET.store(Arc::as_ptr(data) as *mut ContextData, Ordering::SeqCst);

    let pthread = data.pthread.load(Ordering::Acquire) as libc::pthread_t;
    let e = unsafe { libc::pthread_kill(pthread, SIGNAL_REMOTE_PARK) };
    assert_eq!(e, 0, "failed to signal the thread: {}", errno::Errno(e));

    while !data.remote_parked.load(Ordering::Acquire) {
        thread::yield_now();
    }
}

extern "C" fn remote_park_signal_handler(
    _signo: c_int,
    _info: *mut libc::siginfo_t,
    _uctx: *mut libc::c_void,
) {
    let ptr = PARK_TARGET.swap(null_mut(), Ordering::SeqCst);
    assert!(!ptr.is_null(), "stray park signal");
    // The pointee is kept alive by the Arc owned by this very thread, so the
    // borrow outlives the park below.
    let data = unsafe { &*ptr };

    if data.in_gate_op.load(Ordering::Relaxed) {
        // The interrupted code holds the gate's spin lock. Parking here would
        // wedge everyone who needs that lock, so let the interrupted code
        // park itself as soon as the lock is out of its hands.
        data.deferred_park.store(true, Ordering::Relaxed);
        data.remote_parked.store(true, Ordering::Release);
        return;
    }

    data.remote_parked.store(true, Ordering::Release);
    park_raw(data);
    while data.is_defunct() {
        // Destroyed while parked in a handler frame. There is nothing to
        // unwind to, so the thread stays parked for good.
        park_raw(data);
    }
    // Dispatched. The dispatcher made us the gate owner; give the gate up and
    // resume the interrupted code.
    data.gate.release_context(data);
}

pub(crate) fn ok_or_errno(x: c_int) -> Result<c_int, errno::Errno> {
    if x == -1 {
        Err(errno::errno())
    } else {
        Ok(x)
    }
}

pub(crate) fn isize_ok_or_errno(x: isize) -> Result<isize, errno::Errno> {
    if x == -1 {
        Err(errno::errno())
    } else {
        Ok(x)
    }
}
