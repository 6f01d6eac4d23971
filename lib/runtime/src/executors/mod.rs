// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Executor layers.
//!
//! Leaves ([`eager`], [`remote`]) do the work. Decorators ([`reference_resolving`],
//! [`thread_delegating`], [`sequence`]) wrap any executor and add one concern each.
//! [`federating`] interprets placement intrinsics over a [`FederatingStrategy`],
//! either flat ([`resolving_strategy`]) or over child stacks
//! ([`composing_strategy`]).
//!
//! [`FederatingStrategy`]: federating::FederatingStrategy

pub mod composing_strategy;
pub mod eager;
pub mod federating;
pub mod reference_resolving;
pub mod remote;
pub mod resolving_strategy;
pub mod sequence;
pub mod thread_delegating;

pub use composing_strategy::{ChildStack, ComposingStrategy};
pub use eager::{EagerExecutor, EagerLeafFactory, LeafFactory, LeafRole};
pub use federating::{FederatingExecutor, FederatingStrategy};
pub use reference_resolving::ReferenceResolvingExecutor;
pub use remote::RemoteExecutor;
pub use resolving_strategy::ResolvingStrategy;
pub use sequence::SequenceExecutor;
pub use thread_delegating::ThreadDelegatingExecutor;
