//! Dedicated I/O worker queues.
//!
//! Disk work is funneled through named OS threads instead of the async
//! runtime so a stalled disk cannot clog the executor, and so writes on a
//! single queue are strictly serialized.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use anyhow::{bail, Error};
use tokio::sync::oneshot;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Single worker thread executing tasks strictly in submission order.
pub struct TaskQueue {
    name: String,
    sender: crossbeam_channel::Sender<Task>,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue").field("name", &self.name).finish()
    }
}

impl TaskQueue {
    pub fn new(name: &str) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded::<Task>();
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(task) = receiver.recv() {
                    task();
                }
            })
            .expect("unable to spawn I/O worker thread");

        Self {
            name: name.to_string(),
            sender,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fire-and-forget submission. Returns false if the queue is gone.
    pub fn submit<F: FnOnce() + Send + 'static>(&self, task: F) -> bool {
        self.sender.send(Box::new(task)).is_ok()
    }

    /// Run a task on the queue and await its result.
    pub async fn run<T, F>(&self, task: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, Error> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        if !self.submit(move || {
            let _ = tx.send(task());
        }) {
            bail!("task queue '{}' is shut down", self.name);
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => bail!("task queue '{}' dropped the task", self.name),
        }
    }
}

/// Class of a fair-share queue consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoClass {
    /// Background work (scans, downloads, replication).
    System,
    /// Foreground client reads.
    User,
}

struct FairState {
    system: VecDeque<Task>,
    user: VecDeque<Task>,
    serve_user: bool,
    closed: bool,
}

impl FairState {
    fn pick(&mut self) -> Option<Task> {
        let task = if self.serve_user {
            self.user.pop_front().or_else(|| self.system.pop_front())
        } else {
            self.system.pop_front().or_else(|| self.user.pop_front())
        };
        if task.is_some() {
            self.serve_user = !self.serve_user;
        }
        task
    }
}

struct FairShared {
    state: Mutex<FairState>,
    condvar: Condvar,
}

/// Worker thread alternating fairly between a system and a user lane, so
/// background scans cannot starve client reads and vice versa.
pub struct FairShareQueue {
    name: String,
    shared: Arc<FairShared>,
}

impl std::fmt::Debug for FairShareQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FairShareQueue").field("name", &self.name).finish()
    }
}

impl FairShareQueue {
    pub fn new(name: &str) -> Self {
        let shared = Arc::new(FairShared {
            state: Mutex::new(FairState {
                system: VecDeque::new(),
                user: VecDeque::new(),
                serve_user: true,
                closed: false,
            }),
            condvar: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                let task = {
                    let mut state = worker_shared.state.lock().unwrap();
                    loop {
                        if let Some(task) = state.pick() {
                            break task;
                        }
                        if state.closed {
                            return;
                        }
                        state = worker_shared.condvar.wait(state).unwrap();
                    }
                };
                task();
            })
            .expect("unable to spawn I/O worker thread");

        Self {
            name: name.to_string(),
            shared,
        }
    }

    pub fn submit<F: FnOnce() + Send + 'static>(&self, class: IoClass, task: F) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        if state.closed {
            return false;
        }
        match class {
            IoClass::System => state.system.push_back(Box::new(task)),
            IoClass::User => state.user.push_back(Box::new(task)),
        }
        drop(state);
        self.shared.condvar.notify_one();
        true
    }

    pub async fn run<T, F>(&self, class: IoClass, task: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, Error> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        if !self.submit(class, move || {
            let _ = tx.send(task());
        }) {
            bail!("task queue '{}' is shut down", self.name);
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => bail!("task queue '{}' dropped the task", self.name),
        }
    }
}

impl Drop for FairShareQueue {
    fn drop(&mut self) {
        // the worker drains queued tasks, then exits
        self.shared.state.lock().unwrap().closed = true;
        self.shared.condvar.notify_all();
    }
}
