//! Asynchronous file I/O, implemented by a dedicated worker thread.
//!
//! Requests are posted with a token; the worker performs the operation with
//! plain POSIX calls and then reports the result to the registered completion
//! handler from inside the interrupt gate, like any other interrupt.
use std::{
    ffi::CString,
    sync::{mpsc, Arc},
    thread,
};

use crate::MachineInner;

/// A file operation to perform asynchronously. Data is transferred through
/// the shared region only; `addr` is an address inside it.
#[derive(Debug)]
pub enum FileOp {
    Open { path: CString, flags: i32, mode: u32 },
    Close { fd: i32 },
    Read { fd: i32, addr: usize, len: usize },
    Write { fd: i32, addr: usize, len: usize },
    Seek { fd: i32, offset: i32, whence: i32 },
}

pub(crate) enum IoCmd {
    Request { op: FileOp, token: usize },
    Stop,
}

pub(crate) fn spawn_io_worker(
    inner: Arc<MachineInner>,
) -> (mpsc::Sender<IoCmd>, thread::JoinHandle<()>) {
    let (send, recv) = mpsc::channel();

    let join_handle = thread::Builder::new()
        .name("vmk io".to_owned())
        .spawn(move || loop {
            match recv.recv() {
                Ok(IoCmd::Request { op, token }) => {
                    log::trace!("io: {:?} (token = {})", op, token);
                    let result = perform(&inner, op);

                    inner.gate.interrupt_enter();
                    if let Some(hook) = inner.io_hook.get() {
                        hook(token, result);
                    }
                    inner.gate.interrupt_exit();
                }
                Ok(IoCmd::Stop) | Err(mpsc::RecvError) => break,
            }
        })
        .unwrap();

    (send, join_handle)
}

/// Runs one operation to completion. Failures are reported as the negated
/// `errno` value, successes as the non-negative POSIX return value.
fn perform(inner: &MachineInner, op: FileOp) -> i32 {
    match op {
        FileOp::Open { path, flags, mode } => {
            let fd = unsafe { libc::open(path.as_ptr(), flags, mode as libc::c_uint) };
            if fd < 0 {
                neg_errno()
            } else {
                fd
            }
        }
        FileOp::Close { fd } => {
            let ret = unsafe { libc::close(fd) };
            if ret < 0 {
                neg_errno()
            } else {
                ret
            }
        }
        FileOp::Read { fd, addr, len } => match inner.shared_ptr(addr, len) {
            Some(ptr) => {
                let got = unsafe { libc::read(fd, ptr as *mut libc::c_void, len) };
                if got < 0 {
                    neg_errno()
                } else {
                    got as i32
                }
            }
            None => -libc::EFAULT,
        },
        FileOp::Write { fd, addr, len } => match inner.shared_ptr(addr, len) {
            Some(ptr) => {
                let put = unsafe { libc::write(fd, ptr as *const libc::c_void, len) };
                if put < 0 {
                    neg_errno()
                } else {
                    put as i32
                }
            }
            None => -libc::EFAULT,
        },
        FileOp::Seek { fd, offset, whence } => {
            let pos = unsafe { libc::lseek(fd, offset as libc::off_t, whence) };
            if pos < 0 {
                neg_errno()
            } else {
                pos as i32
            }
        }
    }
}

fn neg_errno() -> i32 {
    let e = errno::errno().0;
    if e > 0 {
        -e
    } else {
        -1
    }
}
