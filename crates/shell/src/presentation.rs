//! Hand-off from the network task to the presentation loop. UI callbacks are
//! never invoked on the delivering thread; they are posted here and run, in
//! FIFO order, by whoever drives the [`PresentationLoop`].

use tokio::sync::mpsc;

type Task = Box<dyn FnOnce() + Send>;

#[derive(Clone)]
pub struct PresentationQueue {
    tx: mpsc::UnboundedSender<Task>,
}

pub struct PresentationLoop {
    rx: mpsc::UnboundedReceiver<Task>,
}

impl PresentationQueue {
    pub fn channel() -> (Self, PresentationLoop) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, PresentationLoop { rx })
    }

    /// Queue `task` for the presentation loop. Returns `false` if the loop
    /// has been dropped; the task is discarded.
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tx.send(Box::new(task)).is_err() {
            tracing::debug!("presentation loop gone, dropping ui task");
            return false;
        }
        true
    }
}

impl PresentationLoop {
    /// Run everything queued so far without waiting. Returns the count run.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.rx.try_recv() {
            task();
            ran += 1;
        }
        ran
    }

    /// Wait for the next task and run it. Returns `false` once every queue
    /// handle has been dropped.
    pub async fn run_next(&mut self) -> bool {
        match self.rx.recv().await {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }
}
