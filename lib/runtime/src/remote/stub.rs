// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transport abstraction for remote executors.

use std::fmt::Debug;

use async_trait::async_trait;

use crate::error::Result;
use crate::remote::protocol::{Request, Response};

/// One connection to an executor service.
///
/// Transport failures surface as [`ExecutorError::Connectivity`](crate::error::ExecutorError::Connectivity).
#[async_trait]
pub trait RemoteStub: Send + Sync + Debug {
    fn endpoint(&self) -> &str;

    async fn connect(&self) -> Result<()>;

    /// Health check; false once the connection is lost or closed.
    fn is_ready(&self) -> bool;

    async fn dispatch(&self, request: Request) -> Result<Response>;

    async fn close(&self);
}

/// A configured remote worker. Produces a fresh, unconnected stub per executor.
pub trait RemoteWorker: Send + Sync + Debug {
    fn endpoint(&self) -> &str;

    fn stub(&self) -> Box<dyn RemoteStub>;
}
