//! A user-level thread runtime above the simulated machine of
//! [`vmk_machine`].
//!
//! Threads move through a four-state lifecycle (DEAD, READY, RUNNING,
//! WAITING). A three-lane FIFO scheduler dispatches the highest-priority
//! READY thread, rotating equal priorities, and the periodic alarm preempts
//! whatever is running. Mutexes hand ownership directly to their
//! highest-priority waiter. Memory comes from first-fit pool allocators in
//! 64-byte granules: pool 0 covers the machine's shared I/O transfer region
//! and pool 1 the runtime's own heap. File operations park the calling
//! thread until the machine reports completion.
//!
//! [`start`] boots the runtime on the calling thread, which becomes thread 1,
//! and runs the program's main entry. Everything else is a method on the
//! [`Kernel`] handle every entry point receives. Public operations mask the
//! alarm for their whole duration, so kernel state is only ever changed with
//! interrupts held off.
use std::sync::Arc;
use std::time::Duration;

use spin::Mutex as SpinMutex;
use vmk_machine::Machine;

mod error;
mod io;
mod mask;
mod mempool;
mod mutex;
mod sched;
mod thread;
mod timeout;

pub use error::*;
pub use mempool::ALLOC_QUANTUM;
pub use thread::{Priority, ThreadEntry, ThreadState};

use mempool::PoolCb;
use mutex::MutexCb;
use sched::ReadyQueues;
use thread::ThreadCb;

/// Count of tick interrupts.
pub type Tick = u32;
/// Identifies a thread. A deleted thread's id is invalid until the slot is
/// reused.
pub type ThreadId = usize;
/// Identifies a mutex. A deleted mutex's id is invalid until the slot is
/// reused.
pub type MutexId = usize;
/// Identifies a memory pool. Pool ids are never reused.
pub type PoolId = usize;

/// Wait forever.
pub const TIMEOUT_INFINITE: Tick = Tick::MAX;
/// Do not wait at all.
pub const TIMEOUT_IMMEDIATE: Tick = 0;
/// An id no thread ever has.
pub const THREAD_ID_INVALID: ThreadId = usize::MAX;
/// An id no pool ever has.
pub const POOL_ID_INVALID: PoolId = usize::MAX;
/// The pool over the shared I/O transfer region.
pub const SHARED_POOL_ID: PoolId = 0;
/// The pool over the runtime's heap. Thread stacks come from here.
pub const SYSTEM_POOL_ID: PoolId = 1;

pub(crate) const IDLE_THREAD: ThreadId = 0;
pub(crate) const MAIN_THREAD: ThreadId = 1;

/// Entry point a program hands to [`start`].
pub type MainEntry = fn(&Kernel, &[String]);

/// Boot configuration for [`start`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Tick interrupt period in milliseconds.
    pub tick_ms: u32,
    /// Size of the heap behind the system pool.
    pub heap_size: usize,
    /// Size of the shared I/O transfer region (and of pool 0 over it).
    pub shared_size: usize,
    /// Stack size of the idle thread.
    pub idle_stack_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_ms: 10,
            heap_size: 1 << 20,
            shared_size: 1 << 14,
            idle_stack_size: 1 << 16,
        }
    }
}

/// Handle to a running runtime. Clones refer to the same runtime.
#[derive(Clone)]
pub struct Kernel {
    pub(crate) shared: Arc<KernelShared>,
}

pub(crate) struct KernelShared {
    pub(crate) machine: Machine,
    pub(crate) state: SpinMutex<KernelState>,
    pub(crate) tick_ms: u32,
    /// Backing storage of the system pool.
    heap: Box<[u8]>,
}

pub(crate) struct KernelState {
    pub(crate) cur_thread: ThreadId,
    pub(crate) tick_count: Tick,
    pub(crate) threads: Vec<Option<ThreadCb>>,
    pub(crate) ready: ReadyQueues,
    pub(crate) sleepers: Vec<ThreadId>,
    pub(crate) mutexes: Vec<Option<MutexCb>>,
    pub(crate) pools: Vec<PoolCb>,
    pub(crate) next_pool_id: PoolId,
    /// Serializes the shared transfer region between file operations.
    pub(crate) shared_mutex: MutexCb,
}

/// First frame of every activated thread's context: runs the entry with
/// interrupts unmasked, then terminates the thread when it returns.
pub(crate) fn thread_skeleton(shared: Arc<KernelShared>, thread: ThreadId) {
    let kernel = Kernel { shared };
    let (entry, param) = {
        let st = kernel.shared.state.lock();
        let tcb = st.thread(thread).expect("skeleton of a deleted thread");
        (tcb.entry.expect("boot thread in a skeleton"), tcb.param)
    };
    kernel.shared.machine.critical_exit();

    entry(&kernel, param);

    let _ = kernel.thread_terminate(thread);
    unreachable!("terminated thread was dispatched");
}

/// Body of the idle context: spins with interrupts unmasked until the
/// machine is torn down.
fn idle_body(machine: Machine) {
    machine.critical_exit();
    while machine.context_live() {
        std::thread::yield_now();
    }
}

/// Boots the runtime and runs `main` as thread 1 at NORMAL priority.
///
/// Returns once `main` does, after stopping the alarm and the I/O worker and
/// reaping the contexts of whatever threads remain. A thread still running
/// its entry at that point is the program's bug, not the runtime's; its
/// native thread is reclaimed only when the process exits.
pub fn start(config: Config, main: MainEntry, args: &[String]) -> Result<(), StartError> {
    if config.tick_ms == 0
        || config.heap_size == 0
        || config.shared_size == 0
        || config.idle_stack_size == 0
    {
        return Err(StartError::InvalidParameter);
    }

    let heap = vec![0u8; config.heap_size].into_boxed_slice();
    let mut system_pool = PoolCb::new(SYSTEM_POOL_ID, heap.as_ptr() as usize, heap.len());
    let idle_stack = system_pool
        .allocate(config.idle_stack_size)
        .ok_or(StartError::InvalidParameter)?;

    let machine = Machine::new(config.shared_size);
    let pools = vec![
        PoolCb::new(SHARED_POOL_ID, machine.shared_base(), machine.shared_size()),
        system_pool,
    ];

    // The calling thread becomes thread 1. The gate stays held until the
    // alarm is live so no interrupt sees a half-built kernel.
    let boot_context = machine.adopt_boot_context();
    machine.critical_enter();
    let idle_context = machine.context_create(
        {
            let machine = machine.clone();
            move || idle_body(machine)
        },
        config.idle_stack_size,
    );

    let mut idle = ThreadCb::idle_or_main(Priority::Low);
    idle.stack_addr = idle_stack;
    idle.stack_size = config.idle_stack_size;
    idle.context = Some(idle_context);
    idle.state = ThreadState::Ready;

    let mut boot = ThreadCb::idle_or_main(Priority::Normal);
    boot.context = Some(boot_context);
    boot.state = ThreadState::Running;

    let shared = Arc::new(KernelShared {
        machine,
        state: SpinMutex::new(KernelState {
            cur_thread: MAIN_THREAD,
            tick_count: 0,
            threads: vec![Some(idle), Some(boot)],
            ready: ReadyQueues::default(),
            sleepers: Vec::new(),
            mutexes: Vec::new(),
            pools,
            next_pool_id: 2,
            shared_mutex: MutexCb::new(),
        }),
        tick_ms: config.tick_ms,
        heap,
    });

    let weak = Arc::downgrade(&shared);
    shared.machine.set_tick_handler(move || {
        if let Some(shared) = weak.upgrade() {
            timeout::on_tick(&shared);
        }
    });
    let weak = Arc::downgrade(&shared);
    shared.machine.set_io_handler(move |token, result| {
        if let Some(shared) = weak.upgrade() {
            io::complete(&shared, token, result);
        }
    });
    shared.machine.start_alarm(Duration::from_millis(u64::from(config.tick_ms)));

    log::trace!(
        "start: {} ms tick, {} byte heap, {} byte shared region",
        config.tick_ms,
        shared.heap.len(),
        shared.machine.shared_size(),
    );
    let kernel = Kernel {
        shared: Arc::clone(&shared),
    };
    shared.machine.critical_exit();

    main(&kernel, args);

    shared.machine.terminate();
    log::trace!("start: main returned, runtime stopped");
    Ok(())
}
