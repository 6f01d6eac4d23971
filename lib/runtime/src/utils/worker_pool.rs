// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bounded task pool with awaitable completions.
//!
//! [`WorkerPool::submit`] returns a [`Completion`] without waiting: the work is
//! already running (or queued for a permit) on the pool's runtime. Dropping a
//! completion does not cancel the work; tearing the pool down does.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{ExecutorError, Result};

/// Where pool tasks run.
#[derive(Clone, Debug)]
pub enum WorkerRuntime {
    /// A runtime owned by someone else, usually the caller's.
    External(Handle),
    /// A runtime built for and shared by the pools of one factory.
    Dedicated(Arc<DedicatedRuntime>),
}

impl WorkerRuntime {
    /// The runtime of the calling task.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(WorkerRuntime::External)
            .map_err(|e| ExecutorError::Internal(format!("no tokio runtime available: {e}")))
    }

    /// A dedicated multi-threaded runtime with `threads` workers.
    pub fn dedicated(threads: usize) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name("fedexec-worker")
            .enable_all()
            .build()
            .map_err(|e| ExecutorError::Internal(format!("failed to build worker runtime: {e}")))?;
        Ok(WorkerRuntime::Dedicated(Arc::new(DedicatedRuntime(Some(
            runtime,
        )))))
    }

    /// Dedicated runtime when `threads` is set, the caller's otherwise.
    pub fn from_threads(threads: Option<usize>) -> Result<Self> {
        match threads {
            Some(n) => Self::dedicated(n),
            None => Self::current(),
        }
    }

    pub fn handle(&self) -> Handle {
        match self {
            WorkerRuntime::External(handle) => handle.clone(),
            WorkerRuntime::Dedicated(rt) => rt.handle(),
        }
    }
}

/// Owned runtime that can be dropped from inside an async context.
#[derive(Debug)]
pub struct DedicatedRuntime(Option<tokio::runtime::Runtime>);

impl DedicatedRuntime {
    fn handle(&self) -> Handle {
        match &self.0 {
            Some(rt) => rt.handle().clone(),
            // only reachable during drop
            None => Handle::current(),
        }
    }
}

impl Drop for DedicatedRuntime {
    fn drop(&mut self) {
        if let Some(rt) = self.0.take() {
            rt.shutdown_background();
        }
    }
}

/// The eventual result of a submitted task.
#[must_use = "a completion does nothing unless awaited"]
pub struct Completion<T> {
    state: CompletionState<T>,
}

enum CompletionState<T> {
    Ready(Option<Result<T>>),
    Running(JoinHandle<Result<T>>),
}

// The result is moved out by value and never pinned.
impl<T> Unpin for Completion<T> {}

impl<T> Completion<T> {
    fn ready(result: Result<T>) -> Self {
        Self {
            state: CompletionState::Ready(Some(result)),
        }
    }

    pub fn is_finished(&self) -> bool {
        match &self.state {
            CompletionState::Ready(_) => true,
            CompletionState::Running(handle) => handle.is_finished(),
        }
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            CompletionState::Ready(result) => Poll::Ready(result.take().unwrap_or_else(|| {
                Err(ExecutorError::Internal(
                    "completion polled after it resolved".into(),
                ))
            })),
            CompletionState::Running(handle) => {
                Pin::new(handle).poll(cx).map(|joined| match joined {
                    Ok(result) => result,
                    Err(e) if e.is_cancelled() => Err(ExecutorError::Cancelled),
                    Err(e) => Err(ExecutorError::Internal(format!("worker task failed: {e}"))),
                })
            }
        }
    }
}

#[derive(Debug)]
pub struct WorkerPool {
    name: String,
    runtime: WorkerRuntime,
    tracker: TaskTracker,
    cancel: CancellationToken,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, runtime: WorkerRuntime, max_in_flight: usize) -> Self {
        Self {
            name: name.into(),
            runtime,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of tasks submitted and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Start `task` on the pool and return its completion immediately.
    pub fn submit<F, T>(&self, task: F) -> Completion<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_closed() {
            return Completion::ready(Err(ExecutorError::closed(self.name.clone())));
        }

        let permits = self.permits.clone();
        let cancel = self.cancel.clone();
        let name = self.name.clone();
        let handle = self.tracker.spawn_on(
            async move {
                let run = async move {
                    let _permit = permits
                        .acquire_owned()
                        .await
                        .map_err(|_| ExecutorError::closed(name))?;
                    task.await
                };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(ExecutorError::Cancelled),
                    result = run => result,
                }
            },
            &self.runtime.handle(),
        );
        Completion {
            state: CompletionState::Running(handle),
        }
    }

    /// Refuse new work and wait for in-flight work.
    ///
    /// With a `drain` limit, work still running when it expires is cancelled and its
    /// completions resolve to [`ExecutorError::Cancelled`].
    pub async fn shutdown(&self, drain: Option<Duration>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            self.tracker.wait().await;
            return;
        }
        self.tracker.close();

        match drain {
            None => self.tracker.wait().await,
            Some(limit) => {
                if tokio::time::timeout(limit, self.tracker.wait()).await.is_err() {
                    tracing::warn!(
                        pool = %self.name,
                        abandoned = self.tracker.len(),
                        "drain timed out; cancelling remaining work"
                    );
                    self.cancel.cancel();
                    self.tracker.wait().await;
                }
            }
        }
        self.permits.close();
        tracing::debug!(pool = %self.name, "worker pool drained");
    }
}
