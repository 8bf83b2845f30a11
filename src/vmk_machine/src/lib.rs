//! Hosted machine layer for the vmk thread runtime.
//!
//! This crate plays the part the bare machine plays for a real kernel. It
//! provides execution contexts that can be created, switched, and destroyed,
//! a periodic alarm, asynchronous file I/O with completion callbacks, and a
//! fixed shared memory region I/O transfers go through. Everything is
//! simulated on the host: contexts are native threads of which at most one
//! runs program code at a time, and "masking interrupts" means holding the
//! interrupt gate.
//!
//! The layer is deliberately oblivious to threads, scheduling, and priorities;
//! those live one level up.
use once_cell::sync::OnceCell;
use slab::Slab;
use spin::Mutex as SpinMutex;
use std::{
    cell::UnsafeCell,
    sync::{mpsc, Arc},
    thread,
    time::Duration,
};

#[cfg(not(unix))]
compile_error!(
    "vmk_machine drives its contexts with Unix signals and socketpairs; \
     no other host is supported"
);

mod fileio;
mod gate;
mod threading;
mod timer;

pub use fileio::FileOp;

use fileio::IoCmd;
use gate::{Gate, GateOwner};
use threading::ContextData;
use timer::TimerCmd;

/// Identifies an execution context within one [`Machine`].
pub type ContextId = usize;

type TickHook = Box<dyn Fn() + Send + Sync>;
type IoHook = Box<dyn Fn(usize, i32) + Send + Sync>;

/// A simulated machine: contexts, an alarm, async file I/O, and the shared
/// memory region.
///
/// Clones are handles to the same machine.
#[derive(Clone)]
pub struct Machine {
    inner: Arc<MachineInner>,
}

pub(crate) struct MachineInner {
    pub(crate) gate: Arc<Gate>,
    contexts: SpinMutex<Slab<Arc<ContextData>>>,
    shared: SharedRegion,
    pub(crate) tick_hook: OnceCell<TickHook>,
    pub(crate) io_hook: OnceCell<IoHook>,
    timer_cmd: SpinMutex<Option<mpsc::Sender<TimerCmd>>>,
    timer_join: SpinMutex<Option<thread::JoinHandle<()>>>,
    io_cmd: SpinMutex<Option<mpsc::Sender<IoCmd>>>,
    io_join: SpinMutex<Option<thread::JoinHandle<()>>>,
}

/// The memory region file I/O transfers go through.
struct SharedRegion {
    buf: UnsafeCell<Box<[u8]>>,
}

// Safety: the buffer is only ever accessed by the one running context (which
// holds the region's serialization lock one level up) or by the I/O worker
// while that context is waiting for the completion, never by both at once.
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    fn new(size: usize) -> Self {
        Self {
            buf: UnsafeCell::new(vec![0u8; size].into_boxed_slice()),
        }
    }

    fn base(&self) -> usize {
        unsafe { (*self.buf.get()).as_ptr() as usize }
    }

    fn size(&self) -> usize {
        unsafe { (&(*self.buf.get())).len() }
    }

    fn ptr_at(&self, addr: usize, len: usize) -> Option<*mut u8> {
        let offset = addr.checked_sub(self.base())?;
        if offset.checked_add(len)? > self.size() {
            return None;
        }
        Some(unsafe { (*self.buf.get()).as_mut_ptr().add(offset) })
    }
}

impl MachineInner {
    pub(crate) fn shared_ptr(&self, addr: usize, len: usize) -> Option<*mut u8> {
        self.shared.ptr_at(addr, len)
    }
}

impl Machine {
    /// Creates a machine with a shared region of `shared_size` bytes. The
    /// I/O worker starts immediately; the alarm waits for [`Self::start_alarm`].
    pub fn new(shared_size: usize) -> Self {
        let inner = Arc::new(MachineInner {
            gate: Arc::new(Gate::new()),
            contexts: SpinMutex::new(Slab::new()),
            shared: SharedRegion::new(shared_size),
            tick_hook: OnceCell::new(),
            io_hook: OnceCell::new(),
            timer_cmd: SpinMutex::new(None),
            timer_join: SpinMutex::new(None),
            io_cmd: SpinMutex::new(None),
            io_join: SpinMutex::new(None),
        });

        let (send, join) = fileio::spawn_io_worker(Arc::clone(&inner));
        *inner.io_cmd.lock() = Some(send);
        *inner.io_join.lock() = Some(join);

        Machine { inner }
    }

    pub fn shared_base(&self) -> usize {
        self.inner.shared.base()
    }

    pub fn shared_size(&self) -> usize {
        self.inner.shared.size()
    }

    /// Copies `data` into the shared region. Panics if the destination is not
    /// entirely inside the region.
    pub fn shared_write(&self, addr: usize, data: &[u8]) {
        let ptr = self
            .inner
            .shared
            .ptr_at(addr, data.len())
            .expect("shared region write out of bounds");
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) };
    }

    /// Copies from the shared region into `buf`. Panics if the source is not
    /// entirely inside the region.
    pub fn shared_read(&self, addr: usize, buf: &mut [u8]) {
        let ptr = self
            .inner
            .shared
            .ptr_at(addr, buf.len())
            .expect("shared region read out of bounds");
        unsafe { std::ptr::copy_nonoverlapping(ptr, buf.as_mut_ptr(), buf.len()) };
    }

    /// Registers the handler the alarm calls on every period, inside the
    /// interrupt gate.
    pub fn set_tick_handler(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.inner
            .tick_hook
            .set(Box::new(hook))
            .map_err(|_| ())
            .expect("tick handler already registered");
    }

    /// Registers the handler completions are reported to, inside the
    /// interrupt gate. Arguments are the request token and the result.
    pub fn set_io_handler(&self, hook: impl Fn(usize, i32) + Send + Sync + 'static) {
        self.inner
            .io_hook
            .set(Box::new(hook))
            .map_err(|_| ())
            .expect("io handler already registered");
    }

    /// Starts the periodic alarm.
    pub fn start_alarm(&self, period: Duration) {
        let (send, join) = timer::spawn_timer(Arc::clone(&self.inner), period);
        *self.inner.timer_cmd.lock() = Some(send);
        *self.inner.timer_join.lock() = Some(join);
    }

    /// Creates a parked context. `body` runs when the context is first
    /// dispatched, already owning the gate.
    pub fn context_create(
        &self,
        body: impl FnOnce() + Send + 'static,
        stack_size: usize,
    ) -> ContextId {
        let mut contexts = self.inner.contexts.lock();
        let entry = contexts.vacant_entry();
        let slot = entry.key();
        let data = threading::spawn_context(
            Arc::clone(&self.inner.gate),
            slot,
            Box::new(body),
            stack_size,
        );
        entry.insert(data);
        slot
    }

    /// Registers the calling thread as a context, for the thread that boots
    /// the runtime.
    pub fn adopt_boot_context(&self) -> ContextId {
        let mut contexts = self.inner.contexts.lock();
        let entry = contexts.vacant_entry();
        let slot = entry.key();
        let data = threading::adopt_current(Arc::clone(&self.inner.gate), slot);
        entry.insert(data);
        slot
    }

    /// Destroys a context. If its thread is parked it dismantles itself on
    /// wake; a running context must not be destroyed.
    pub fn context_destroy(&self, id: ContextId) {
        let data = self.inner.contexts.lock().try_remove(id);
        if let Some(data) = data {
            data.mark_defunct();
        }
    }

    /// Suspends `prev` and dispatches `next`.
    ///
    /// Called by the running context itself (gate owner), the switch happens
    /// immediately and this returns when `prev` is dispatched again. Called
    /// from an interrupt handler, `prev` is suspended on the spot and `next`
    /// starts when the interrupt finishes.
    pub fn context_switch(&self, prev: ContextId, next: ContextId) {
        if prev == next {
            return;
        }
        let (prev_data, next_data) = {
            let contexts = self.inner.contexts.lock();
            (
                contexts.get(prev).cloned().expect("unknown context"),
                contexts.get(next).cloned().expect("unknown context"),
            )
        };

        match self.inner.gate.owner() {
            GateOwner::Context(slot) => {
                debug_assert_eq!(slot, prev, "only the running context may switch away");
                log::trace!("context_switch: {} -> {}", prev, next);
                self.inner.gate.transfer_to(&next_data);
                next_data.unpark();
                threading::park_for_dispatch(&prev_data);
            }
            GateOwner::Interrupt => {
                log::trace!("context_switch (interrupt): {} -> {}", prev, next);
                threading::remote_park(&prev_data);
                self.inner.gate.set_pending_dispatch(next_data);
            }
            GateOwner::Free => unreachable!("context switch outside a critical section"),
        }
    }

    /// Whether the calling context still exists. A body that loops forever
    /// polls this to learn when to return.
    pub fn context_live(&self) -> bool {
        threading::with_current(|data| !data.is_defunct()).unwrap_or(false)
    }

    /// Masks interrupts: waits until the gate is free and takes it for the
    /// calling context.
    pub fn critical_enter(&self) {
        threading::with_current(|data| self.inner.gate.acquire_context(data))
            .expect("calling thread is not a context");
    }

    /// Unmasks interrupts. A no-op if the calling context does not own the
    /// gate.
    pub fn critical_exit(&self) {
        threading::with_current(|data| self.inner.gate.release_context(data))
            .expect("calling thread is not a context");
    }

    /// Posts an asynchronous file operation. The completion handler receives
    /// `token` and the result.
    pub fn file_request(&self, op: FileOp, token: usize) {
        let cmd = self.inner.io_cmd.lock();
        match &*cmd {
            Some(send) => {
                let _ = send.send(IoCmd::Request { op, token });
            }
            None => log::warn!("io request after shutdown (token = {})", token),
        }
    }

    /// Stops the alarm and the I/O worker and destroys every remaining
    /// context.
    pub fn terminate(&self) {
        if let Some(send) = self.inner.timer_cmd.lock().take() {
            let _ = send.send(TimerCmd::Stop);
        }
        if let Some(join) = self.inner.timer_join.lock().take() {
            let _ = join.join();
        }
        if let Some(send) = self.inner.io_cmd.lock().take() {
            let _ = send.send(IoCmd::Stop);
        }
        if let Some(join) = self.inner.io_join.lock().take() {
            let _ = join.join();
        }

        let contexts: Vec<_> = {
            let mut contexts = self.inner.contexts.lock();
            contexts.drain().collect()
        };
        for data in contexts {
            data.mark_defunct();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn init_logging() {
        let _ = env_logger::Builder::from_default_env()
            .is_test(true)
            .try_init();
    }

    fn machine_pair(shared_size: usize) -> (Machine, Machine) {
        let machine = Machine::new(shared_size);
        let other = machine.clone();
        (machine, other)
    }

    #[test]
    fn dispatch_runs_the_context_body() {
        init_logging();
        let (machine, machine2) = machine_pair(0);
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        let ctx_cell = Arc::new(AtomicUsize::new(usize::MAX));
        let ctx_cell2 = Arc::clone(&ctx_cell);

        let boot = machine.adopt_boot_context();
        machine.critical_enter();
        let ctx = machine.context_create(
            move || {
                ran2.store(true, Ordering::Release);
                let me = ctx_cell2.load(Ordering::Acquire);
                machine2.context_switch(me, boot);
            },
            64 * 1024,
        );
        ctx_cell.store(ctx, Ordering::Release);

        machine.context_switch(boot, ctx);
        machine.critical_exit();
        assert!(ran.load(Ordering::Acquire));
        machine.terminate();
    }

    #[test]
    fn shared_region_rejects_out_of_range_addresses() {
        init_logging();
        let machine = Machine::new(256);
        let base = machine.shared_base();
        assert!(machine.inner.shared_ptr(base, 256).is_some());
        assert!(machine.inner.shared_ptr(base + 200, 56).is_some());
        assert!(machine.inner.shared_ptr(base + 200, 57).is_none());
        assert!(machine.inner.shared_ptr(base.wrapping_sub(1), 1).is_none());

        machine.shared_write(base + 10, b"abc");
        let mut buf = [0u8; 3];
        machine.shared_read(base + 10, &mut buf);
        assert_eq!(&buf, b"abc");
        machine.terminate();
    }

    #[test]
    fn alarm_fires_repeatedly() {
        init_logging();
        let machine = Machine::new(0);
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks2 = Arc::clone(&ticks);
        machine.set_tick_handler(move || {
            ticks2.fetch_add(1, Ordering::Relaxed);
        });
        machine.start_alarm(Duration::from_millis(5));
        thread::sleep(Duration::from_millis(200));
        machine.terminate();
        assert!(ticks.load(Ordering::Relaxed) >= 2);
    }

    #[test]
    fn io_worker_reports_completions() {
        init_logging();
        let machine = Machine::new(1024);
        let completions = Arc::new(Mutex::new(Vec::new()));
        let completions2 = Arc::clone(&completions);
        machine.set_io_handler(move |token, result| {
            completions2.lock().unwrap().push((token, result));
        });

        let path = std::env::temp_dir().join(format!("vmk-io-{}", std::process::id()));
        let c_path = std::ffi::CString::new(path.to_str().unwrap()).unwrap();

        let wait_for = |n: usize| loop {
            if completions.lock().unwrap().len() >= n {
                break;
            }
            thread::yield_now();
        };

        machine.file_request(
            FileOp::Open {
                path: c_path,
                flags: libc::O_CREAT | libc::O_RDWR | libc::O_TRUNC,
                mode: 0o600,
            },
            1,
        );
        wait_for(1);
        let fd = completions.lock().unwrap()[0].1;
        assert!(fd >= 0);

        let base = machine.shared_base();
        machine.shared_write(base, b"payload");
        machine.file_request(
            FileOp::Write {
                fd,
                addr: base,
                len: 7,
            },
            2,
        );
        wait_for(2);
        assert_eq!(completions.lock().unwrap()[1], (2, 7));

        machine.file_request(
            FileOp::Seek {
                fd,
                offset: 0,
                whence: libc::SEEK_SET,
            },
            3,
        );
        wait_for(3);
        machine.file_request(
            FileOp::Read {
                fd,
                addr: base + 512,
                len: 7,
            },
            4,
        );
        wait_for(4);
        assert_eq!(completions.lock().unwrap()[3], (4, 7));
        let mut buf = [0u8; 7];
        machine.shared_read(base + 512, &mut buf);
        assert_eq!(&buf, b"payload");

        machine.file_request(FileOp::Close { fd }, 5);
        wait_for(5);
        machine.terminate();
        let _ = std::fs::remove_file(path);
    }
}
