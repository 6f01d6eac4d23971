// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

pub use tokio::time::{Duration, Instant};

pub mod worker_pool;

pub use worker_pool::{Completion, WorkerPool, WorkerRuntime};
