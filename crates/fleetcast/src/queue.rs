// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ordered processing queue.
//!
//! Tasks are futures run strictly one at a time in push order. A task may
//! await as much as it likes; the next one starts only when it completes.
//! Draining happens on a spawned task, never inside the caller of
//! [`ProcessingQueue::push`].

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{trace, warn};

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
type DoneHandler = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct QueueState {
    tasks: VecDeque<Task>,
    running: bool,
    on_done: Vec<DoneHandler>,
}

/// FIFO of async tasks with a drain notification.
#[derive(Clone, Default)]
pub struct ProcessingQueue {
    inner: Arc<Mutex<QueueState>>,
}

impl ProcessingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a task. Starts draining on a new task if the queue was idle.
    pub fn push<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.inner.lock();
        state.tasks.push_back(Box::pin(task));
        if !state.running {
            state.running = true;
            tokio::spawn(drain(self.inner.clone()));
        }
    }

    /// Run `handler` once, the next time the queue drains.
    ///
    /// On an idle, empty queue the handler is scheduled right away.
    pub fn when_done<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.lock();
        if state.running || !state.tasks.is_empty() {
            state.on_done.push(Box::new(handler));
            return;
        }
        drop(state);
        tokio::spawn(async move { handler() });
    }

    /// Wait until the queue drains.
    pub async fn drained(&self) {
        let (tx, rx) = oneshot::channel();
        self.when_done(move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }

    /// Tasks waiting to run (excluding the running one).
    pub fn pending(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    /// Nothing running and nothing queued.
    pub fn is_idle(&self) -> bool {
        let state = self.inner.lock();
        !state.running && state.tasks.is_empty()
    }
}

async fn drain(inner: Arc<Mutex<QueueState>>) {
    loop {
        let next = {
            let mut state = inner.lock();
            match state.tasks.pop_front() {
                Some(task) => Ok(task),
                None => {
                    state.running = false;
                    Err(std::mem::take(&mut state.on_done))
                }
            }
        };

        match next {
            // Each task gets its own spawn so a panic only loses that task.
            Ok(task) => {
                if let Err(e) = tokio::spawn(task).await {
                    warn!("Queued task failed: {}", e);
                }
            }
            Err(handlers) => {
                trace!("Queue drained, {} handler(s)", handlers.len());
                for handler in handlers {
                    handler();
                }
                return;
            }
        }
    }
}
