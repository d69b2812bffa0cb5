//! Fixed-size pool of workers draining a shared task queue.

use super::{perform_task, StopSignal, TaskEnvironment, TaskOutcome};
use crate::error::{Error, Result};
use crate::models::Task;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

type Sender = Arc<Mutex<Option<mpsc::UnboundedSender<Arc<Task>>>>>;

pub struct WorkerPool {
    sender: Sender,
    stop_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` workers on the current runtime.
    pub fn start(env: TaskEnvironment, workers: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<Arc<Task>>();
        let (stop_tx, stop_rx) = watch::channel(false);
        let sender: Sender = Arc::new(Mutex::new(Some(tx)));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..workers.max(1))
            .map(|n| {
                let env = env.clone();
                let rx = rx.clone();
                let sender = sender.clone();
                let stop = StopSignal::new(stop_rx.clone());
                tokio::spawn(async move {
                    log::debug!("Worker {n} started");
                    loop {
                        let next = tokio::select! {
                            biased;
                            _ = stop.stopped() => None,
                            task = async { rx.lock().await.recv().await } => task,
                        };
                        let Some(task) = next else { break };
                        if perform_task(&env, &task, &stop).await == TaskOutcome::Requeue {
                            requeue(&sender, task);
                        }
                    }
                    log::debug!("Worker {n} stopped");
                })
            })
            .collect();

        WorkerPool {
            sender,
            stop_tx,
            workers,
        }
    }

    /// Queue a task for the next free worker.
    pub fn submit(&self, task: Arc<Task>) -> Result<()> {
        let guard = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => tx.send(task).map_err(|e| {
                Error::InvalidRequest(format!("worker pool is closed: task {}", e.0.id))
            }),
            None => Err(Error::InvalidRequest(format!(
                "worker pool is shutting down: task {}",
                task.id
            ))),
        }
    }

    /// Stop accepting tasks and wait for the queue to drain.
    pub async fn shutdown(self) {
        self.close();
        futures::future::join_all(self.workers).await;
    }

    /// Raise the stop signal; running tasks fail at their next checkpoint.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        self.close();
        futures::future::join_all(self.workers).await;
    }

    fn close(&self) {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

fn requeue(sender: &Sender, task: Arc<Task>) {
    let guard = sender.lock().unwrap_or_else(|e| e.into_inner());
    match guard.as_ref().map(|tx| tx.send(task.clone())) {
        Some(Ok(())) => log::debug!("Task {} requeued", task.id),
        _ => log::warn!("Task {} left Queued: pool is shutting down", task.id),
    }
}
