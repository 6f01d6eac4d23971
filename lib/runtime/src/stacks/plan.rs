// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Stack topology planning.
//!
//! A [`StackPlan`] is computed from the participant count before any executor
//! exists. Up to `K` participants are served flat. Above that, the root splits
//! participants into chunks of the smallest span `K^d` (`d >= 1`) that yields at
//! most `K` chunks, and each chunk is planned the same way. With `N = 25, K = 10`
//! the root has children of 10, 10 and 5.
//!
//! Remote plans give each worker one near-even range. When there are more workers
//! than `K`, the workers are grouped under intermediate composing nodes by the same
//! span rule, so no node has more than `K` children.

use serde::Serialize;

use crate::error::{ExecutorError, ParticipantRange, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StackPlan {
    /// One executor per participant.
    Resolving { start: usize, end: usize },
    /// Child stacks over contiguous sub-ranges.
    Composing {
        start: usize,
        end: usize,
        children: Vec<StackPlan>,
    },
    /// A range served by the remote worker at this index.
    Remote {
        start: usize,
        end: usize,
        worker: usize,
    },
}

impl StackPlan {
    /// Plan a local stack for `participants` with fan-out bound `fan_out`.
    pub fn local(participants: usize, fan_out: usize) -> Result<Self> {
        if fan_out < 2 {
            return Err(ExecutorError::Config(format!(
                "fan_out_threshold must be at least 2, got {fan_out}"
            )));
        }
        Ok(plan_range(ParticipantRange::new(0, participants), fan_out))
    }

    /// Plan a composing tree with one remote leaf per non-empty near-even range.
    pub fn remote(participants: usize, workers: usize, fan_out: usize) -> Result<Self> {
        if workers == 0 {
            return Err(ExecutorError::Config(
                "remote planning requires at least one worker".into(),
            ));
        }
        if fan_out < 2 {
            return Err(ExecutorError::Config(format!(
                "fan_out_threshold must be at least 2, got {fan_out}"
            )));
        }
        let leaves = partition_even(participants, workers)
            .into_iter()
            .enumerate()
            .map(|(worker, range)| StackPlan::Remote {
                start: range.start,
                end: range.end,
                worker,
            })
            .collect();
        Ok(compose_nodes(leaves, fan_out))
    }

    pub fn range(&self) -> ParticipantRange {
        match self {
            StackPlan::Resolving { start, end }
            | StackPlan::Composing { start, end, .. }
            | StackPlan::Remote { start, end, .. } => ParticipantRange::new(*start, *end),
        }
    }

    /// Number of composition levels below this node.
    pub fn depth(&self) -> usize {
        match self {
            StackPlan::Composing { children, .. } => {
                1 + children.iter().map(StackPlan::depth).max().unwrap_or(0)
            }
            _ => 0,
        }
    }

    /// Ranges of the nodes that own participants, in order.
    pub fn leaf_ranges(&self) -> Vec<ParticipantRange> {
        let mut out = Vec::new();
        self.collect_leaf_ranges(&mut out);
        out
    }

    fn collect_leaf_ranges(&self, out: &mut Vec<ParticipantRange>) {
        match self {
            StackPlan::Composing { children, .. } => {
                for child in children {
                    child.collect_leaf_ranges(out);
                }
            }
            other => out.push(other.range()),
        }
    }
}

fn plan_range(range: ParticipantRange, fan_out: usize) -> StackPlan {
    let n = range.len();
    if n <= fan_out {
        return StackPlan::Resolving {
            start: range.start,
            end: range.end,
        };
    }

    let span = root_span(n, fan_out);
    let children = partition(range.clone(), span)
        .into_iter()
        .map(|child| plan_range(child, fan_out))
        .collect();
    StackPlan::Composing {
        start: range.start,
        end: range.end,
        children,
    }
}

/// Group `nodes` under composing nodes of at most `fan_out` children each.
fn compose_nodes(mut nodes: Vec<StackPlan>, fan_out: usize) -> StackPlan {
    let start = nodes.first().map_or(0, |n| n.range().start);
    let end = nodes.last().map_or(0, |n| n.range().end);
    if nodes.len() <= fan_out {
        return StackPlan::Composing {
            start,
            end,
            children: nodes,
        };
    }

    let span = root_span(nodes.len(), fan_out);
    let mut children = Vec::new();
    while !nodes.is_empty() {
        let rest = nodes.split_off(span.min(nodes.len()));
        children.push(compose_nodes(nodes, fan_out));
        nodes = rest;
    }
    StackPlan::Composing {
        start,
        end,
        children,
    }
}

/// Smallest `fan_out^d` (`d >= 1`) with `ceil(n / fan_out^d) <= fan_out`.
fn root_span(n: usize, fan_out: usize) -> usize {
    let mut span = fan_out;
    while n.div_ceil(span) > fan_out {
        match span.checked_mul(fan_out) {
            Some(next) => span = next,
            None => return n,
        }
    }
    span
}

/// Split `range` into consecutive chunks of `span`, the last one possibly shorter.
pub fn partition(range: ParticipantRange, span: usize) -> Vec<ParticipantRange> {
    let span = span.max(1);
    (range.start..range.end)
        .step_by(span)
        .map(|start| ParticipantRange::new(start, (start + span).min(range.end)))
        .collect()
}

/// Split `0..n` into at most `parts` contiguous ranges whose sizes differ by at
/// most one. Empty ranges are omitted.
pub fn partition_even(n: usize, parts: usize) -> Vec<ParticipantRange> {
    if parts == 0 {
        return Vec::new();
    }
    let base = n / parts;
    let extra = n % parts;
    let mut start = 0;
    let mut out = Vec::with_capacity(parts);
    for i in 0..parts {
        let size = base + usize::from(i < extra);
        if size == 0 {
            break;
        }
        out.push(ParticipantRange::new(start, start + size));
        start += size;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn child_sizes(plan: &StackPlan) -> Vec<usize> {
        match plan {
            StackPlan::Composing { children, .. } => children.iter().map(|c| c.range().len()).collect(),
            _ => vec![],
        }
    }

    fn max_fan_out(plan: &StackPlan) -> usize {
        match plan {
            StackPlan::Composing { children, .. } => children
                .iter()
                .map(max_fan_out)
                .max()
                .unwrap_or(0)
                .max(children.len()),
            StackPlan::Resolving { start, end } => end - start,
            StackPlan::Remote { .. } => 0,
        }
    }

    #[rstest]
    #[case(3, 10, vec![])]
    #[case(10, 10, vec![])]
    #[case(25, 10, vec![10, 10, 5])]
    #[case(100, 10, vec![10; 10])]
    #[case(101, 10, vec![100, 1])]
    #[case(250, 10, vec![100, 100, 50])]
    #[case(7, 2, vec![4, 3])]
    fn test_root_children(#[case] n: usize, #[case] k: usize, #[case] expected: Vec<usize>) {
        let plan = StackPlan::local(n, k).unwrap();
        assert_eq!(child_sizes(&plan), expected);
    }

    #[rstest]
    #[case(0, 10)]
    #[case(1, 2)]
    #[case(25, 10)]
    #[case(1234, 10)]
    #[case(999, 3)]
    #[case(100_000, 100)]
    fn test_partitioning_is_exact(#[case] n: usize, #[case] k: usize) {
        let plan = StackPlan::local(n, k).unwrap();
        let leaves = plan.leaf_ranges();

        let mut next = 0;
        for range in &leaves {
            assert_eq!(range.start, next);
            assert!(range.len() <= k);
            next = range.end;
        }
        assert_eq!(next, n);
        assert!(max_fan_out(&plan) <= k);
    }

    #[test]
    fn test_depth() {
        assert_eq!(StackPlan::local(10, 10).unwrap().depth(), 0);
        assert_eq!(StackPlan::local(25, 10).unwrap().depth(), 1);
        assert_eq!(StackPlan::local(101, 10).unwrap().depth(), 2);
    }

    #[test]
    fn test_fan_out_must_be_at_least_two() {
        assert!(StackPlan::local(5, 1).is_err());
    }

    #[rstest]
    #[case(25, 3, vec![9, 8, 8])]
    #[case(2, 4, vec![1, 1])]
    #[case(0, 2, vec![])]
    fn test_partition_even(#[case] n: usize, #[case] parts: usize, #[case] expected: Vec<usize>) {
        let sizes: Vec<usize> = partition_even(n, parts).iter().map(|r| r.len()).collect();
        assert_eq!(sizes, expected);
    }

    #[test]
    fn test_remote_plan() {
        let plan = StackPlan::remote(25, 2, 10).unwrap();
        assert_eq!(
            plan,
            StackPlan::Composing {
                start: 0,
                end: 25,
                children: vec![
                    StackPlan::Remote {
                        start: 0,
                        end: 13,
                        worker: 0
                    },
                    StackPlan::Remote {
                        start: 13,
                        end: 25,
                        worker: 1
                    },
                ],
            }
        );
    }

    #[rstest]
    #[case(12, 5, 3, vec![3, 2])]
    #[case(40, 20, 3, vec![9, 9, 2])]
    #[case(4, 10, 3, vec![3, 1])]
    fn test_remote_plan_bounds_fan_out(
        #[case] n: usize,
        #[case] workers: usize,
        #[case] k: usize,
        #[case] expected_root: Vec<usize>,
    ) {
        let plan = StackPlan::remote(n, workers, k).unwrap();
        assert!(max_fan_out(&plan) <= k);

        let leaves = plan.leaf_ranges();
        assert_eq!(leaves.len(), workers.min(n));
        assert_eq!(leaves.last().map_or(0, |r| r.end), n);

        let root: Vec<usize> = match &plan {
            StackPlan::Composing { children, .. } => {
                children.iter().map(|c| c.leaf_ranges().len()).collect()
            }
            _ => vec![],
        };
        assert_eq!(root, expected_root);
    }

    #[test]
    fn test_plan_serializes() {
        let json = serde_json::to_value(StackPlan::local(25, 10).unwrap()).unwrap();
        assert_eq!(json["kind"], "composing");
        assert_eq!(json["children"].as_array().unwrap().len(), 3);
    }
}
