//! The node model — every construct in a suite (containers, examples,
//! setup/teardown hooks, suite fixtures, reporting hooks, deferred cleanups)
//! is a [`Node`] with a kind, a code location, and a body closure.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::report::{Report, SpecReport};

pub type NodeId = u32;

static NEXT_NODE_ID: AtomicU32 = AtomicU32::new(1);

/// Ids are monotonic within the process so ordered-group bookkeeping can key
/// on them across retries.
pub(crate) fn next_node_id() -> NodeId {
    NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed)
}

/// A source location captured at a constructor call site.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeLocation {
    pub file: String,
    pub line: u32,
}

impl CodeLocation {
    #[track_caller]
    pub fn caller() -> Self {
        let loc = std::panic::Location::caller();
        CodeLocation {
            file: loc.file().to_string(),
            line: loc.line(),
        }
    }
}

impl fmt::Display for CodeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Container,
    It,
    BeforeEach,
    JustBeforeEach,
    AfterEach,
    JustAfterEach,
    BeforeAll,
    AfterAll,
    BeforeSuite,
    AfterSuite,
    SynchronizedBeforeSuite,
    SynchronizedAfterSuite,
    ReportBeforeEach,
    ReportAfterEach,
    ReportAfterSuite,
    CleanupInvalid,
    CleanupAfterEach,
    CleanupAfterAll,
    CleanupAfterSuite,
}

impl NodeKind {
    pub fn is_cleanup(self) -> bool {
        matches!(
            self,
            NodeKind::CleanupInvalid
                | NodeKind::CleanupAfterEach
                | NodeKind::CleanupAfterAll
                | NodeKind::CleanupAfterSuite
        )
    }

    pub fn is_report(self) -> bool {
        matches!(
            self,
            NodeKind::ReportBeforeEach | NodeKind::ReportAfterEach | NodeKind::ReportAfterSuite
        )
    }

    pub fn is_before_suite_family(self) -> bool {
        matches!(
            self,
            NodeKind::BeforeSuite | NodeKind::SynchronizedBeforeSuite
        )
    }

    pub fn is_after_suite_family(self) -> bool {
        matches!(self, NodeKind::AfterSuite | NodeKind::SynchronizedAfterSuite)
    }

    /// Nodes that report against the suite itself rather than a spec.
    pub fn is_suite_level(self) -> bool {
        self.is_before_suite_family()
            || self.is_after_suite_family()
            || matches!(self, NodeKind::ReportAfterSuite | NodeKind::CleanupAfterSuite)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeKind::Container => "Container",
            NodeKind::It => "It",
            NodeKind::BeforeEach => "BeforeEach",
            NodeKind::JustBeforeEach => "JustBeforeEach",
            NodeKind::AfterEach => "AfterEach",
            NodeKind::JustAfterEach => "JustAfterEach",
            NodeKind::BeforeAll => "BeforeAll",
            NodeKind::AfterAll => "AfterAll",
            NodeKind::BeforeSuite => "BeforeSuite",
            NodeKind::AfterSuite => "AfterSuite",
            NodeKind::SynchronizedBeforeSuite => "SynchronizedBeforeSuite",
            NodeKind::SynchronizedAfterSuite => "SynchronizedAfterSuite",
            NodeKind::ReportBeforeEach => "ReportBeforeEach",
            NodeKind::ReportAfterEach => "ReportAfterEach",
            NodeKind::ReportAfterSuite => "ReportAfterSuite",
            NodeKind::CleanupInvalid => "DeferCleanup",
            NodeKind::CleanupAfterEach => "DeferCleanup (Each)",
            NodeKind::CleanupAfterAll => "DeferCleanup (All)",
            NodeKind::CleanupAfterSuite => "DeferCleanup (Suite)",
        };
        f.write_str(s)
    }
}

/// The user-supplied body, shaped by the node kind. Bodies are reference
/// counted so nodes clone cheaply into spec chains.
#[derive(Clone)]
pub(crate) enum NodeBody {
    None,
    /// Runs zero or more times (retries re-invoke it).
    Standard(Rc<dyn Fn()>),
    /// Entered exactly once, during BuildTree.
    Container(Rc<RefCell<Option<Box<dyn FnOnce()>>>>),
    /// Receives the in-flight spec report.
    ReportEach(Rc<dyn Fn(&SpecReport)>),
    /// Receives the aggregated suite report.
    ReportSuite(Rc<dyn Fn(&Report)>),
    /// Split body: primary process produces a payload, every process consumes it.
    SyncBeforeSuite {
        primary: Rc<dyn Fn() -> Vec<u8>>,
        all_procs: Rc<dyn Fn(&[u8])>,
    },
    /// Split body: every process runs the first part, the primary runs the second last.
    SyncAfterSuite {
        all_procs: Rc<dyn Fn()>,
        primary: Rc<dyn Fn()>,
    },
}

#[derive(Clone)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) kind: NodeKind,
    pub(crate) text: String,
    pub(crate) code_location: CodeLocation,
    pub(crate) nesting_level: i32,
    pub(crate) labels: Vec<String>,
    pub(crate) focused: bool,
    pub(crate) pending: bool,
    pub(crate) ordered: bool,
    pub(crate) serial: bool,
    pub(crate) flake_attempts: u32,
    /// For cleanup nodes: the id of the node whose body registered them.
    pub(crate) cleanup_generator_id: NodeId,
    pub(crate) body: NodeBody,
}

impl Node {
    pub(crate) fn new(kind: NodeKind, text: impl Into<String>, location: CodeLocation) -> Self {
        Node {
            id: next_node_id(),
            kind,
            text: text.into(),
            code_location: location,
            nesting_level: 0,
            labels: Vec::new(),
            focused: false,
            pending: false,
            ordered: false,
            serial: false,
            flake_attempts: 0,
            cleanup_generator_id: 0,
            body: NodeBody::None,
        }
    }

    /// The pseudo-node at the root of the tree. Never executed or reported.
    pub(crate) fn root() -> Self {
        Node {
            id: 0,
            kind: NodeKind::Container,
            text: String::new(),
            code_location: CodeLocation::default(),
            nesting_level: -1,
            labels: Vec::new(),
            focused: false,
            pending: false,
            ordered: false,
            serial: false,
            flake_attempts: 0,
            cleanup_generator_id: 0,
            body: NodeBody::None,
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("text", &self.text)
            .field("nesting_level", &self.nesting_level)
            .finish_non_exhaustive()
    }
}

/// Collection helpers over node chains. Filters clone — nodes are cheap to
/// clone because bodies are reference counted.
pub(crate) trait NodesExt {
    fn with_kind(&self, kind: NodeKind) -> Vec<Node>;
    fn first_with_kind(&self, kind: NodeKind) -> Option<&Node>;
    fn contains_node_id(&self, id: NodeId) -> bool;
    fn has_node_marked_pending(&self) -> bool;
    fn has_node_marked_serial(&self) -> bool;
    fn has_node_marked_focus(&self) -> bool;
    /// The outermost node marked Ordered, chains being root-to-leaf.
    fn first_node_marked_ordered(&self) -> Option<&Node>;
}

impl NodesExt for [Node] {
    fn with_kind(&self, kind: NodeKind) -> Vec<Node> {
        self.iter().filter(|n| n.kind == kind).cloned().collect()
    }

    fn first_with_kind(&self, kind: NodeKind) -> Option<&Node> {
        self.iter().find(|n| n.kind == kind)
    }

    fn contains_node_id(&self, id: NodeId) -> bool {
        self.iter().any(|n| n.id == id)
    }

    fn has_node_marked_pending(&self) -> bool {
        self.iter().any(|n| n.pending)
    }

    fn has_node_marked_serial(&self) -> bool {
        self.iter().any(|n| n.serial)
    }

    fn has_node_marked_focus(&self) -> bool {
        self.iter().any(|n| n.focused)
    }

    fn first_node_marked_ordered(&self) -> Option<&Node> {
        self.iter().find(|n| n.ordered)
    }
}

/// Stable sorts, so nodes at the same nesting level keep source order.
pub(crate) fn sorted_by_ascending_nesting(mut nodes: Vec<Node>) -> Vec<Node> {
    nodes.sort_by_key(|n| n.nesting_level);
    nodes
}

pub(crate) fn sorted_by_descending_nesting(mut nodes: Vec<Node>) -> Vec<Node> {
    nodes.sort_by_key(|n| std::cmp::Reverse(n.nesting_level));
    nodes
}

pub(crate) fn within_nesting_level(nodes: Vec<Node>, max_level: i32) -> Vec<Node> {
    nodes
        .into_iter()
        .filter(|n| n.nesting_level <= max_level)
        .collect()
}
