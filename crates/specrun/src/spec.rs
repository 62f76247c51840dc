//! Spec generation, filtering, ordering, and grouping.
//!
//! A spec is one `It` leaf plus the chain of its ancestor containers and
//! fixtures, root to leaf. Groups are the unit handed to the driver: every
//! spec sharing an `Ordered` ancestor lands in that ancestor's group, in
//! source order.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::config::SuiteConfig;
use crate::node::{Node, NodeId, NodeKind, NodesExt};
use crate::tree::TreeNode;

#[derive(Clone, Debug)]
pub(crate) struct Spec {
    pub nodes: Vec<Node>,
    /// Generation-time skip decision (focus policy, label filter, pending).
    pub skip: bool,
}

impl Spec {
    pub fn leaf(&self) -> &Node {
        self.nodes
            .first_with_kind(NodeKind::It)
            .expect("specrun: spec chain has no It leaf")
    }

    /// The largest flake-attempts decoration anywhere in the chain; a
    /// container-level decoration covers every spec beneath it.
    pub fn flake_attempts(&self) -> u32 {
        self.nodes.iter().map(|n| n.flake_attempts).max().unwrap_or(0)
    }

    pub fn union_of_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = Vec::new();
        for node in &self.nodes {
            for label in &node.labels {
                if !labels.contains(label) {
                    labels.push(label.clone());
                }
            }
        }
        labels
    }
}

/// Depth-first walk producing specs in source order. Every fixture child of
/// a container applies to all leaves beneath it, regardless of where in the
/// container body it was declared.
pub(crate) fn generate_specs(tree: &TreeNode) -> Vec<Spec> {
    let mut specs = Vec::new();
    walk(None, &tree.children, &[], &mut specs);
    specs
}

fn walk(container: Option<&Node>, children: &[TreeNode], chain: &[Node], specs: &mut Vec<Spec>) {
    let mut level_chain: Vec<Node> = chain.to_vec();
    if let Some(node) = container {
        level_chain.push(node.clone());
    }
    for child in children {
        if !matches!(child.node.kind, NodeKind::Container | NodeKind::It) {
            level_chain.push(child.node.clone());
        }
    }
    for child in children {
        match child.node.kind {
            NodeKind::It => {
                let mut nodes = level_chain.clone();
                nodes.push(child.node.clone());
                specs.push(Spec { nodes, skip: false });
            }
            NodeKind::Container => {
                walk(Some(&child.node), &child.children, &level_chain, specs);
            }
            _ => {}
        }
    }
}

/// Marks skips from pending decorations, programmatic focus, and the label
/// filter. Returns whether any spec is focused programmatically.
pub(crate) fn apply_focus_to_specs(
    specs: &mut [Spec],
    config: &SuiteConfig,
) -> bool {
    let has_programmatic_focus = specs
        .iter()
        .any(|s| s.nodes.has_node_marked_focus() && !s.nodes.has_node_marked_pending());

    for spec in specs.iter_mut() {
        if spec.nodes.has_node_marked_pending() {
            spec.skip = true;
            continue;
        }
        if has_programmatic_focus && !spec.nodes.has_node_marked_focus() {
            spec.skip = true;
        }
        if let Some(filter) = &config.label_filter {
            if !labels_match_filter(filter, &spec.union_of_labels()) {
                spec.skip = true;
            }
        }
    }

    has_programmatic_focus
}

/// Label filter syntax:
/// - `integration` — matches if any label equals "integration"
/// - `!slow` — matches if no label equals "slow"
/// - `integration,smoke` — OR: matches if any label matches any filter term
/// - `integration+fast` — AND: matches if labels include all filter terms
pub(crate) fn labels_match_filter(filter: &str, labels: &[String]) -> bool {
    if filter.is_empty() {
        return true;
    }

    let contains = |term: &str| labels.iter().any(|l| l == term);

    // AND filter: "a+b" means all must match
    if filter.contains('+') {
        return filter.split('+').all(|term| contains(term.trim()));
    }

    // OR filter: "a,b" means any must match
    filter.split(',').any(|term| {
        let term = term.trim();
        if let Some(negated) = term.strip_prefix('!') {
            !contains(negated)
        } else {
            contains(term)
        }
    })
}

pub(crate) fn count_without_skip(specs: &[Spec]) -> usize {
    specs.iter().filter(|s| !s.skip).count()
}

pub(crate) fn has_any_pending(specs: &[Spec]) -> bool {
    specs.iter().any(|s| s.nodes.has_node_marked_pending())
}

/// Groups of spec indices, each group sharing its outermost Ordered ancestor
/// (or a singleton group when there is none).
pub(crate) type GroupedSpecIndices = Vec<Vec<usize>>;

/// Partitions specs into (parallel-eligible, serial-only) group lists.
/// Ordering modes shuffle the sequence of groups, never the specs within.
pub(crate) fn order_specs(
    specs: &[Spec],
    config: &SuiteConfig,
) -> (GroupedSpecIndices, GroupedSpecIndices) {
    let mut groups: GroupedSpecIndices = Vec::new();
    let mut group_for_node: HashMap<NodeId, usize> = HashMap::new();

    for (i, spec) in specs.iter().enumerate() {
        match spec.nodes.first_node_marked_ordered() {
            Some(ordered) => match group_for_node.get(&ordered.id) {
                Some(&g) => groups[g].push(i),
                None => {
                    group_for_node.insert(ordered.id, groups.len());
                    groups.push(vec![i]);
                }
            },
            None => groups.push(vec![i]),
        }
    }

    if config.randomize_groups {
        let mut rng = StdRng::seed_from_u64(config.random_seed);
        groups.shuffle(&mut rng);
    }

    let (serial, parallel): (GroupedSpecIndices, GroupedSpecIndices) =
        groups.into_iter().partition(|group| {
            group
                .iter()
                .any(|&i| specs[i].nodes.has_node_marked_serial())
        });

    (parallel, serial)
}
