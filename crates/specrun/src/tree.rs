//! The container tree and the focus policy applied to it after building.

use crate::node::Node;

/// Suite lifecycle phases. Top-level containers are queued during
/// `BuildTopLevel` so user code can finish configuring the suite before any
/// container body runs; they are entered during `BuildTree`; during `Run`
/// only cleanup nodes may be pushed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    BuildTopLevel,
    BuildTree,
    Run,
}

pub(crate) struct TreeNode {
    pub node: Node,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    pub fn new(node: Node) -> Self {
        TreeNode {
            node,
            children: Vec::new(),
        }
    }

    pub fn root() -> Self {
        TreeNode::new(Node::root())
    }

    /// Follow a path of child indices down from this node.
    pub fn at_path_mut(&mut self, path: &[usize]) -> &mut TreeNode {
        let mut current = self;
        for &idx in path {
            current = &mut current.children[idx];
        }
        current
    }

    pub fn at_path(&self, path: &[usize]) -> &TreeNode {
        let mut current = self;
        for &idx in path {
            current = &current.children[idx];
        }
        current
    }
}

/// Focus applies at the deepest level: a focused container that contains
/// focused descendants loses its own mark, so only the descendants run.
/// Pending subtrees contribute no focus.
pub(crate) fn apply_nested_focus_policy(tree: &mut TreeNode) {
    fn walk(tree: &mut TreeNode) -> bool {
        if tree.node.pending {
            return false;
        }
        let mut has_focused_descendant = false;
        for child in &mut tree.children {
            has_focused_descendant = walk(child) || has_focused_descendant;
        }
        tree.node.focused = tree.node.focused && !has_focused_descendant;
        tree.node.focused || has_focused_descendant
    }
    walk(tree);
}
