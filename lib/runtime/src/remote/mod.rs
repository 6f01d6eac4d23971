// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Remote delegation: the request protocol, the stub abstraction a
//! [`RemoteExecutor`](crate::executors::RemoteExecutor) talks through, the service
//! answering on the other side and an in-process transport.

pub mod loopback;
pub mod protocol;
pub mod service;
pub mod stub;

pub use loopback::{LoopbackStub, LoopbackWorker};
pub use protocol::{Request, Response, ValueId};
pub use service::ExecutorService;
pub use stub::{RemoteStub, RemoteWorker};
