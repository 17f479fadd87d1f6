//! The coordination thread.
//!
//! Status transitions and every status-listener callback run here, one task
//! at a time, in submission order. Background jobs hand their results over
//! with [`Coordinator::invoke`].

use std::{
    any::Any,
    io,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle, ThreadId},
};

use tracing::{error, warn};

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Task),
    Shutdown,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    sender: mpsc::Sender<Message>,
    thread_id: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn spawn(name: &str) -> io::Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_tasks(receiver))?;
        Ok(Self {
            inner: Arc::new(Inner {
                sender,
                thread_id: handle.thread().id(),
                handle: Mutex::new(Some(handle)),
            }),
        })
    }

    pub fn is_current(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// Runs `task` inline when already on the coordination thread, otherwise
    /// queues it.
    pub fn invoke<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_current() {
            task();
        } else {
            self.invoke_later(task);
        }
    }

    pub fn invoke_later<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.sender.send(Message::Run(Box::new(task))).is_err() {
            warn!("Coordination thread has stopped; dropping task");
        }
    }

    /// Runs `task` on the coordination thread and waits for its result.
    /// Returns `None` if the thread stopped or the task panicked.
    pub fn invoke_and_wait<F, R>(&self, task: F) -> Option<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return Some(task());
        }
        let (tx, rx) = mpsc::sync_channel(1);
        self.invoke_later(move || {
            let _ = tx.send(task());
        });
        rx.recv().ok()
    }

    /// Stops the thread after the tasks already queued have run.
    pub fn shutdown(&self) {
        let _ = self.inner.sender.send(Message::Shutdown);
        if self.is_current() {
            return;
        }
        let handle = self
            .inner
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn run_tasks(receiver: mpsc::Receiver<Message>) {
    while let Ok(message) = receiver.recv() {
        match message {
            Message::Run(task) => {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
                    error!("Coordination task panicked: {}", panic_message(&*panic));
                }
            }
            Message::Shutdown => break,
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "panic".to_string()
    }
}
