use std::sync::Mutex;
use std::sync::PoisonError;
use std::thread;
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tokio::sync::mpsc::UnboundedSender;

use crate::errors::Error;

/// A unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Where the tasks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPolicy {
    /// On a dedicated worker thread; submitting returns immediately.
    Background,
    /// On the submitting thread, before submitting returns.
    Sync,
}

enum Message {
    Run(Task),
    Stop(Task),
}

/// Runs submitted tasks one at a time, in submission order.
pub struct TaskQueue {
    policy: DispatchPolicy,
    sender: Mutex<Option<UnboundedSender<Message>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("policy", &self.policy)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl TaskQueue {
    /// Creates a queue. The background policy starts a worker thread called
    /// `name`.
    pub fn new(policy: DispatchPolicy, name: &str) -> Result<Self, Error> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let worker = match policy {
            DispatchPolicy::Sync => None,
            DispatchPolicy::Background => Some(
                thread::Builder::new()
                    .name(name.to_string())
                    .spawn(move || {
                        while let Some(msg) = rx.blocking_recv() {
                            match msg {
                                Message::Run(task) => task(),
                                Message::Stop(done) => {
                                    done();
                                    break;
                                }
                            }
                        }
                        log::debug!("Task queue worker exiting");
                    })
                    .map_err(|e| Error::Spawn(e.to_string()))?,
            ),
        };
        Ok(Self {
            policy,
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(worker),
        })
    }

    /// The execution policy.
    pub fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    /// Returns true once [`TaskQueue::stop`] was called.
    pub fn is_stopped(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Submits a task. Tasks submitted after [`TaskQueue::stop`] are
    /// dropped.
    pub fn add_task(&self, task: Task) {
        match self.policy {
            DispatchPolicy::Sync => {
                if self.is_stopped() {
                    log::warn!("Dropping a task submitted after stop");
                    return;
                }
                task();
            }
            DispatchPolicy::Background => {
                let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
                let sent = sender
                    .as_ref()
                    .is_some_and(|tx| tx.send(Message::Run(task)).is_ok());
                if !sent {
                    log::warn!("Dropping a task submitted after stop");
                }
            }
        }
    }

    /// Runs `done` after every task submitted so far and refuses new
    /// tasks.
    pub fn stop(&self, done: Task) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match (self.policy, sender) {
            (DispatchPolicy::Background, Some(tx)) => {
                if let Err(mpsc::error::SendError(Message::Stop(done) | Message::Run(done))) =
                    tx.send(Message::Stop(done))
                {
                    // the worker is gone, nothing is pending
                    done();
                }
            }
            (_, Some(_)) => done(),
            (_, None) => log::debug!("Task queue already stopped"),
        }
    }

    /// Waits for the worker thread to exit. Only returns after
    /// [`TaskQueue::stop`] was called.
    pub fn join(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = worker {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                log::error!("Task queue worker panicked");
            }
        }
    }
}
