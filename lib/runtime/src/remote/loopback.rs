// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process transport.
//!
//! A [`LoopbackWorker`] serves requests directly through an [`ExecutorService`]
//! without a network hop. Each stub gets its own service session. Reachability can
//! be switched off to simulate a lost worker: stubs stop reporting ready and every
//! dispatch fails with a connectivity error.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::error::{ExecutorError, Result};
use crate::remote::protocol::{Request, Response};
use crate::remote::service::ExecutorService;
use crate::remote::stub::{RemoteStub, RemoteWorker};
use crate::stacks::factory::ExecutorFactory;

#[derive(Debug, Clone)]
pub struct LoopbackWorker {
    endpoint: String,
    factory: ExecutorFactory,
    reachable: Arc<AtomicBool>,
}

impl LoopbackWorker {
    pub fn new(endpoint: impl Into<String>, factory: ExecutorFactory) -> Self {
        Self {
            endpoint: endpoint.into(),
            factory,
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn factory(&self) -> &ExecutorFactory {
        &self.factory
    }

    /// Applies to every stub handed out by this worker, including existing ones.
    pub fn set_reachable(&self, reachable: bool) {
        tracing::debug!(endpoint = %self.endpoint, reachable, "loopback reachability changed");
        self.reachable.store(reachable, Ordering::Release);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Acquire)
    }
}

impl RemoteWorker for LoopbackWorker {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn stub(&self) -> Box<dyn RemoteStub> {
        Box::new(LoopbackStub {
            endpoint: self.endpoint.clone(),
            service: ExecutorService::new(self.factory.clone()),
            connected: AtomicBool::new(false),
            reachable: self.reachable.clone(),
        })
    }
}

#[derive(Debug)]
pub struct LoopbackStub {
    endpoint: String,
    service: ExecutorService,
    connected: AtomicBool,
    reachable: Arc<AtomicBool>,
}

impl LoopbackStub {
    fn reachable(&self) -> bool {
        self.reachable.load(Ordering::Acquire)
    }
}

#[async_trait]
impl RemoteStub for LoopbackStub {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn connect(&self) -> Result<()> {
        if !self.reachable() {
            return Err(ExecutorError::connectivity(&self.endpoint, "endpoint unreachable"));
        }
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.connected.load(Ordering::Acquire) && self.reachable()
    }

    async fn dispatch(&self, request: Request) -> Result<Response> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(ExecutorError::connectivity(&self.endpoint, "not connected"));
        }
        if !self.reachable() {
            return Err(ExecutorError::connectivity(&self.endpoint, "connection lost"));
        }
        self.service.handle(request).await
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::Release);
        self.service.close().await;
    }
}
