//! One background worker per client or server instance.
//!
//! The worker thread owns a current-thread Tokio runtime and blocks on it
//! until [`EventLoop::stop`] is called. Every socket operation of the owning
//! instance is spawned onto this runtime, so all completions and observer
//! calls for that instance run on the same thread.

use std::{
    future::Future,
    thread::{self, JoinHandle},
};

use tokio::{
    runtime::{Builder, EnterGuard, Handle},
    sync::oneshot,
    task,
};
use tracing::warn;

use crate::error::TcpError;

pub struct EventLoop {
    handle: Handle,
    shutdown: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl EventLoop {
    /// Builds the runtime and starts the worker thread named `name`.
    pub fn start(name: &str) -> Result<Self, TcpError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(TcpError::EventLoop)?;
        let handle = runtime.handle().clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                // Dropping the runtime here cancels every task still parked
                // on a socket, which closes those sockets.
                drop(runtime);
            })
            .map_err(TcpError::EventLoop)?;

        Ok(Self {
            handle,
            shutdown: Some(shutdown_tx),
            worker: Some(worker),
        })
    }

    /// Schedules `future` on the worker.
    pub fn spawn<F>(&self, future: F) -> task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Enters the runtime context so sockets created on the caller's thread
    /// register with this loop's reactor.
    pub(crate) fn enter(&self) -> EnterGuard<'_> {
        self.handle.enter()
    }

    /// Asks the worker to return. Pending operations are cancelled once the
    /// worker drops the runtime.
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }

    /// Like [`EventLoop::stop`], but the worker keeps running until `task`
    /// has finished. Owners use it to let their connections close before the
    /// runtime goes away.
    pub(crate) fn stop_after<T>(&mut self, task: task::JoinHandle<T>)
    where
        T: Send + 'static,
    {
        if let Some(shutdown) = self.shutdown.take() {
            self.handle.spawn(async move {
                let _ = task.await;
                let _ = shutdown.send(());
            });
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    fn on_worker_thread(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| worker.thread().id() == thread::current().id())
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.stop();
        if self.on_worker_thread() {
            // Joining here would wait on ourselves.
            warn!("event loop dropped from inside one of its own callbacks; not joining worker");
            return;
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("event loop worker panicked");
            }
        }
    }
}
