//! Request Dispatcher
//!
//! Runs each task on its own worker and delivers its outcome as messages:
//! exactly one `Result` or `Error`, then exactly one `Finished`. A receiver
//! that has gone away simply stops hearing about the task.

use std::any::Any;
use std::future::Future;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum DispatchError<E> {
    #[error("{0}")]
    Task(E),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("task was cancelled")]
    Cancelled,
}

/// Message delivered for a dispatched task
#[derive(Debug)]
pub enum DispatchEvent<T, E> {
    Result(T),
    Error(DispatchError<E>),
    /// Always the last event, whichever of the above fired
    Finished,
}

/// Receiving end for one dispatched task. Dropping it discards deliveries.
#[derive(Debug)]
pub struct DispatchHandle<T, E> {
    events: UnboundedReceiver<DispatchEvent<T, E>>,
}

impl<T, E> DispatchHandle<T, E> {
    /// Next event; `None` once everything has been delivered
    pub async fn recv(&mut self) -> Option<DispatchEvent<T, E>> {
        self.events.recv().await
    }

    /// Next event if one is already waiting
    pub fn try_recv(&mut self) -> Option<DispatchEvent<T, E>> {
        self.events.try_recv().ok()
    }

    /// Wait for the task to finish and return its outcome
    pub async fn outcome(mut self) -> Result<T, DispatchError<E>> {
        let mut outcome = None;
        while let Some(event) = self.events.recv().await {
            match event {
                DispatchEvent::Result(value) => outcome = Some(Ok(value)),
                DispatchEvent::Error(e) => outcome = Some(Err(e)),
                DispatchEvent::Finished => break,
            }
        }
        outcome.unwrap_or(Err(DispatchError::Cancelled))
    }
}

/// Spawns tasks onto a tokio runtime. Tasks are independent of each other;
/// no ordering is imposed between them.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    runtime: Handle,
}

impl Dispatcher {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Dispatcher on the runtime of the calling context, if there is one
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    /// Run an async task on its own worker
    pub fn dispatch<F, T, E>(&self, task: F) -> DispatchHandle<T, E>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let worker = self.runtime.spawn(task);
        self.watch(worker)
    }

    /// Run a blocking closure on the blocking pool
    pub fn dispatch_blocking<F, T, E>(&self, task: F) -> DispatchHandle<T, E>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let worker = self.runtime.spawn_blocking(task);
        self.watch(worker)
    }

    fn watch<T, E>(&self, worker: JoinHandle<Result<T, E>>) -> DispatchHandle<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        self.runtime.spawn(deliver(worker, tx));
        DispatchHandle { events: rx }
    }
}

async fn deliver<T, E>(worker: JoinHandle<Result<T, E>>, tx: UnboundedSender<DispatchEvent<T, E>>) {
    let event = match worker.await {
        Ok(Ok(value)) => DispatchEvent::Result(value),
        Ok(Err(e)) => DispatchEvent::Error(DispatchError::Task(e)),
        Err(e) if e.is_panic() => {
            let message = panic_message(e.into_panic());
            warn!("Dispatched task panicked: {}", message);
            DispatchEvent::Error(DispatchError::Panicked(message))
        }
        Err(_) => DispatchEvent::Error(DispatchError::Cancelled),
    };

    if tx.send(event).is_err() || tx.send(DispatchEvent::Finished).is_err() {
        debug!("Receiver dropped, discarding task outcome");
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{oneshot, Notify};

    fn dispatcher() -> Dispatcher {
        Dispatcher::current().unwrap()
    }

    #[tokio::test]
    async fn test_result_then_finished() {
        let mut handle = dispatcher().dispatch(async { Ok::<_, String>(42) });

        assert!(matches!(handle.recv().await, Some(DispatchEvent::Result(42))));
        assert!(matches!(handle.recv().await, Some(DispatchEvent::Finished)));
        assert!(handle.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_error_then_finished() {
        let mut handle = dispatcher().dispatch(async { Err::<u32, _>("offline".to_string()) });

        match handle.recv().await {
            Some(DispatchEvent::Error(DispatchError::Task(e))) => assert_eq!(e, "offline"),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(handle.recv().await, Some(DispatchEvent::Finished)));
    }

    #[tokio::test]
    async fn test_panic_surfaces_as_error() {
        let handle = dispatcher().dispatch(async {
            if true {
                panic!("sensor table corrupt");
            }
            Ok::<u32, String>(0)
        });

        match handle.outcome().await {
            Err(DispatchError::Panicked(message)) => {
                assert!(message.contains("sensor table corrupt"))
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        // The dispatcher keeps working afterwards
        let again = dispatcher().dispatch(async { Ok::<_, String>("ok") });
        assert_eq!(again.outcome().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_ignored() {
        let (done_tx, done_rx) = oneshot::channel();
        let handle = dispatcher().dispatch(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = done_tx.send(());
            Ok::<_, String>(1)
        });
        drop(handle);

        done_rx.await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tasks_run_concurrently() {
        let gate = Arc::new(Notify::new());
        let d = dispatcher();

        let waiting = d.dispatch({
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Ok::<_, String>("released")
            }
        });
        let opener = d.dispatch(async move {
            gate.notify_one();
            Ok::<_, String>("opened")
        });

        assert_eq!(opener.outcome().await.unwrap(), "opened");
        let released = tokio::time::timeout(Duration::from_secs(1), waiting.outcome())
            .await
            .unwrap();
        assert_eq!(released.unwrap(), "released");
    }

    #[tokio::test]
    async fn test_blocking_task() {
        let handle = dispatcher().dispatch_blocking(|| {
            std::thread::sleep(Duration::from_millis(10));
            Ok::<_, String>(7)
        });
        assert_eq!(handle.outcome().await.unwrap(), 7);
    }
}
