// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod builder;
pub mod factory;
pub mod plan;

pub use builder::ExecutorStack;
pub use factory::{CacheStats, ExecutorFactory, ExecutorFactoryOptions, ExecutorHandle};
pub use plan::StackPlan;
