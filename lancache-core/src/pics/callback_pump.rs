//! Single-thread actor that drains a channel of Steam callbacks and
//! resolves the waiter promise for the matching job id: a background
//! `thread::spawn` feeding an `mpsc` channel that callers receive from,
//! carrying a job id so multiple in-flight jobs can share one pump.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

/// One callback delivered off the wire, tagged with the job it belongs to.
#[derive(Debug, Clone)]
pub struct JobCallback<T> {
    pub job_id: u64,
    pub payload: T,
    /// Multi-part jobs (product info) keep sending callbacks until this
    /// is `false`.
    pub more_expected: bool,
}

enum PumpCommand<T> {
    Callback(JobCallback<T>),
    /// Registers interest in a job id; replies on the given sender once the
    /// terminal callback for that job arrives.
    Subscribe(u64, Sender<Vec<T>>),
}

#[derive(Debug)]
pub enum WaitError {
    Timeout,
    PumpGone,
}

/// Drains callbacks on a dedicated thread and completes waiters by job id.
/// `T` is whatever payload shape the concrete `SteamSession` implementation
/// chooses to deliver (a product-info chunk, a changes-since page, ...).
pub struct CallbackPump<T: Send + 'static> {
    cb_tx: Sender<JobCallback<T>>,
    cmd_tx: Sender<PumpCommand<T>>,
    _handle: thread::JoinHandle<()>,
}

impl<T: Send + 'static> CallbackPump<T> {
    pub fn new() -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel::<PumpCommand<T>>();
        let (cb_tx, cb_rx) = mpsc::channel::<JobCallback<T>>();

        // Bridge thread: callbacks arriving on `cb_rx` are forwarded into
        // the single command queue the actor loop owns, so callback
        // delivery and subscribe requests never race on the pending-waiter
        // map below.
        let forward_tx = cmd_tx.clone();
        thread::spawn(move || {
            while let Ok(cb) = cb_rx.recv() {
                if forward_tx.send(PumpCommand::Callback(cb)).is_err() {
                    break;
                }
            }
        });

        let handle = thread::spawn(move || run_actor(cmd_rx));

        Self {
            cb_tx,
            cmd_tx,
            _handle: handle,
        }
    }

    /// Sender a `SteamSession` implementation's I/O thread uses to deliver
    /// callbacks as they arrive off the wire.
    pub fn callback_sender(&self) -> Sender<JobCallback<T>> {
        self.cb_tx.clone()
    }

    /// Registers interest in `job_id` and blocks up to `timeout` for its
    /// terminal batch of callbacks. Single-callback jobs pass a 5-minute
    /// timeout, multi-part jobs 10 minutes.
    pub fn wait(&self, job_id: u64, timeout: Duration) -> Result<Vec<T>, WaitError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.cmd_tx
            .send(PumpCommand::Subscribe(job_id, reply_tx))
            .map_err(|_| WaitError::PumpGone)?;
        match reply_rx.recv_timeout(timeout) {
            Ok(payload) => Ok(payload),
            Err(RecvTimeoutError::Timeout) => Err(WaitError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(WaitError::PumpGone),
        }
    }
}

impl<T: Send + 'static> Default for CallbackPump<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn run_actor<T: Send + 'static>(cmd_rx: Receiver<PumpCommand<T>>) {
    let mut pending: HashMap<u64, Vec<T>> = HashMap::new();
    let mut waiters: HashMap<u64, Sender<Vec<T>>> = HashMap::new();

    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            PumpCommand::Callback(cb) => {
                let entry = pending.entry(cb.job_id).or_default();
                entry.push(cb.payload);
                if !cb.more_expected {
                    if let Some(waiter) = waiters.remove(&cb.job_id) {
                        let collected = pending.remove(&cb.job_id).unwrap_or_default();
                        let _ = waiter.send(collected);
                    }
                }
            }
            PumpCommand::Subscribe(job_id, reply) => {
                // A terminal callback may have already arrived before the
                // subscribe request landed; that case is handled here too
                // since both kinds of message share one ordered queue.
                if let Some(collected) = pending.remove(&job_id) {
                    let _ = reply.send(collected);
                } else {
                    waiters.insert(job_id, reply);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_terminal_callback_resolves_wait() {
        let pump: CallbackPump<&'static str> = CallbackPump::new();
        let sender = pump.callback_sender();
        sender
            .send(JobCallback {
                job_id: 1,
                payload: "done",
                more_expected: false,
            })
            .unwrap();

        let result = pump.wait(1, Duration::from_secs(5)).unwrap();
        assert_eq!(result, vec!["done"]);
    }

    #[test]
    fn multi_part_job_accumulates_until_terminal() {
        let pump: CallbackPump<i32> = CallbackPump::new();
        let sender = pump.callback_sender();
        sender
            .send(JobCallback {
                job_id: 7,
                payload: 1,
                more_expected: true,
            })
            .unwrap();
        sender
            .send(JobCallback {
                job_id: 7,
                payload: 2,
                more_expected: true,
            })
            .unwrap();
        sender
            .send(JobCallback {
                job_id: 7,
                payload: 3,
                more_expected: false,
            })
            .unwrap();

        let result = pump.wait(7, Duration::from_secs(5)).unwrap();
        assert_eq!(result, vec![1, 2, 3]);
    }

    #[test]
    fn wait_times_out_when_no_callback_arrives() {
        let pump: CallbackPump<i32> = CallbackPump::new();
        let result = pump.wait(99, Duration::from_millis(50));
        assert!(matches!(result, Err(WaitError::Timeout)));
    }

    #[test]
    fn subscribing_after_callback_already_arrived_still_resolves() {
        let pump: CallbackPump<i32> = CallbackPump::new();
        let sender = pump.callback_sender();
        sender
            .send(JobCallback {
                job_id: 3,
                payload: 42,
                more_expected: false,
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let result = pump.wait(3, Duration::from_secs(5)).unwrap();
        assert_eq!(result, vec![42]);
    }
}
