//! Blocking file operations over the machine's asynchronous I/O.
//!
//! Every operation parks the calling thread until the completion interrupt
//! arrives. Reads and writes additionally stage their bytes through the
//! machine's shared transfer region, one 512-byte chunk at a time, under the
//! internal mutex that serializes access to it.
use std::ffi::CString;

use vmk_machine::FileOp;

use crate::error::IoError;
use crate::mutex::{self, MutexRef};
use crate::sched;
use crate::thread::ThreadState;
use crate::{Kernel, KernelShared, SHARED_POOL_ID, TIMEOUT_INFINITE};

/// Staging granule for shared-region transfers.
const IO_CHUNK: usize = 512;

/// Posts `op` to the machine and parks the calling thread until its
/// completion lands. Returns the operation's raw result.
///
/// The caller must have masked interrupts; the thread resumes inside the
/// same masked section.
fn block_on_io(kernel: &Kernel, op: FileOp) -> i32 {
    let token = {
        let mut st = kernel.shared.state.lock();
        let cur = st.cur_thread;
        st.thread_mut(cur).expect("no current thread").state = ThreadState::Waiting;
        cur
    };
    kernel.shared.machine.file_request(op, token);
    sched::schedule(&kernel.shared);

    let st = kernel.shared.state.lock();
    st.thread(token).expect("no current thread").wait_result
}

/// Handles an I/O completion interrupt: records the result and readies the
/// issuing thread.
///
/// A completion for a thread that is no longer WAITING (terminated while
/// blocked) is dropped.
pub(crate) fn complete(shared: &KernelShared, token: usize, result: i32) {
    {
        let mut st = shared.state.lock();
        let live = st
            .thread(token)
            .map(|t| t.state == ThreadState::Waiting)
            .unwrap_or(false);
        if !live {
            log::trace!("io: completion for {} dropped", token);
            return;
        }
        let prio = st.thread(token).expect("checked above").prio;
        {
            let tcb = st.thread_mut(token).expect("checked above");
            tcb.wait_result = result;
            tcb.state = ThreadState::Ready;
        }
        st.ready.enqueue(prio, token);
        log::trace!("io: completion {} for {}", result, token);
    }
    sched::schedule(shared);
}

/// Takes the shared-region mutex and a staging chunk from the shared pool.
fn claim_staging(kernel: &Kernel) -> Result<usize, IoError> {
    let acquired = mutex::acquire_core(kernel, MutexRef::SharedRegion, TIMEOUT_INFINITE);
    debug_assert!(acquired);
    let staging = {
        let mut st = kernel.shared.state.lock();
        st.pool_mut(SHARED_POOL_ID).and_then(|p| p.allocate(IO_CHUNK))
    };
    match staging {
        Some(addr) => Ok(addr),
        None => {
            mutex::release_with_resched(kernel, MutexRef::SharedRegion);
            Err(IoError::Failure)
        }
    }
}

/// Returns the staging chunk and hands the shared region to the next
/// waiting thread.
fn release_staging(kernel: &Kernel, staging: usize) {
    {
        let mut st = kernel.shared.state.lock();
        if let Some(pool) = st.pool_mut(SHARED_POOL_ID) {
            pool.deallocate(staging);
        }
    }
    mutex::release_with_resched(kernel, MutexRef::SharedRegion);
}

impl Kernel {
    /// Opens a file, parking the caller until the descriptor is ready.
    pub fn file_open(&self, path: &str, flags: i32, mode: u32) -> Result<i32, IoError> {
        let path = CString::new(path).map_err(|_| IoError::InvalidParameter)?;
        let _mask = self.mask();
        let fd = block_on_io(self, FileOp::Open { path, flags, mode });
        if fd < 0 {
            return Err(IoError::Failure);
        }
        Ok(fd)
    }

    /// Closes a descriptor opened through [`file_open`](Self::file_open).
    pub fn file_close(&self, fd: i32) -> Result<(), IoError> {
        let _mask = self.mask();
        let result = block_on_io(self, FileOp::Close { fd });
        if result < 0 {
            return Err(IoError::Failure);
        }
        Ok(())
    }

    /// Repositions a descriptor, returning the new offset.
    pub fn file_seek(&self, fd: i32, offset: i32, whence: i32) -> Result<i32, IoError> {
        let _mask = self.mask();
        let result = block_on_io(self, FileOp::Seek { fd, offset, whence });
        if result < 0 {
            return Err(IoError::Failure);
        }
        Ok(result)
    }

    /// Reads into `buf`, staging through the shared region chunk by chunk.
    /// Returns the number of bytes read, which is short at end of file.
    pub fn file_read(&self, fd: i32, buf: &mut [u8]) -> Result<usize, IoError> {
        let _mask = self.mask();
        let staging = claim_staging(self)?;

        let mut total = 0;
        let mut offset = 0;
        while offset < buf.len() {
            let chunk = (buf.len() - offset).min(IO_CHUNK);
            let n = block_on_io(self, FileOp::Read { fd, addr: staging, len: chunk });
            if n < 0 {
                release_staging(self, staging);
                return Err(IoError::Failure);
            }
            let n = (n as usize).min(chunk);
            self.shared
                .machine
                .shared_read(staging, &mut buf[offset..offset + n]);
            total += n;
            offset += chunk;
            if n < chunk {
                break;
            }
        }

        release_staging(self, staging);
        Ok(total)
    }

    /// Writes `data`, staging through the shared region chunk by chunk.
    /// Returns the number of bytes written.
    pub fn file_write(&self, fd: i32, data: &[u8]) -> Result<usize, IoError> {
        let _mask = self.mask();
        let staging = claim_staging(self)?;

        let mut total = 0;
        let mut offset = 0;
        while offset < data.len() {
            let chunk = (data.len() - offset).min(IO_CHUNK);
            self.shared
                .machine
                .shared_write(staging, &data[offset..offset + chunk]);
            let n = block_on_io(self, FileOp::Write { fd, addr: staging, len: chunk });
            if n < 0 {
                release_staging(self, staging);
                return Err(IoError::Failure);
            }
            let n = (n as usize).min(chunk);
            total += n;
            offset += chunk;
            if n < chunk {
                break;
            }
        }

        release_staging(self, staging);
        Ok(total)
    }

    /// Writes `text` to standard output.
    pub fn print(&self, text: &str) -> Result<(), IoError> {
        self.file_write(1, text.as_bytes()).map(|_| ())
    }
}
