//! The periodic alarm, implemented by a dedicated timer thread.
use std::{
    sync::{mpsc, Arc},
    thread,
    time::{Duration, Instant},
};

use crate::MachineInner;

#[derive(Debug)]
pub(crate) enum TimerCmd {
    Stop,
}

/// Spawns the timer thread. Every `period` it enters the interrupt gate and
/// runs the registered tick handler.
pub(crate) fn spawn_timer(
    inner: Arc<MachineInner>,
    period: Duration,
) -> (mpsc::Sender<TimerCmd>, thread::JoinHandle<()>) {
    let (send, recv) = mpsc::channel();

    let join_handle = thread::Builder::new()
        .name("vmk timer".to_owned())
        .spawn(move || {
            let mut deadline = Instant::now() + period;
            loop {
                let wait = deadline.saturating_duration_since(Instant::now());
                match recv.recv_timeout(wait) {
                    Ok(cmd) => {
                        log::trace!("timer: {:?}", cmd);
                        let TimerCmd::Stop = cmd;
                        break;
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        inner.gate.interrupt_enter();
                        if let Some(hook) = inner.tick_hook.get() {
                            hook();
                        }
                        inner.gate.interrupt_exit();

                        deadline += period;
                        let now = Instant::now();
                        if deadline < now {
                            // Fell behind (a long interrupt or a stopped
                            // debugger); resynchronize instead of bursting.
                            deadline = now + period;
                        }
                    }
                }
            }
        })
        .unwrap();

    (send, join_handle)
}
