//! Build-time and coordination errors.
//!
//! Build errors abort tree construction and are reported as suite failures
//! without running any spec. Each carries the code location of the offending
//! declaration.

use thiserror::Error;

use crate::node::{CodeLocation, NodeKind};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SuiteError {
    #[error("a {kind} node marked Serial may not appear inside an Ordered container that is not itself marked Serial (declared at {location})")]
    InvalidSerialNodeInNonSerialOrderedContainer {
        kind: NodeKind,
        location: CodeLocation,
    },

    #[error("{kind} nodes may only appear inside an Ordered container (declared at {location})")]
    SetupNodeNotInOrderedContainer {
        kind: NodeKind,
        location: CodeLocation,
    },

    #[error("a {kind} node may not be pushed once the suite has started running (declared at {location})")]
    PushingNodeInRunPhase {
        kind: NodeKind,
        location: CodeLocation,
    },

    #[error("{kind} nodes may only be declared at the top level, not inside a container (declared at {location})")]
    SuiteNodeInNestedContext {
        kind: NodeKind,
        location: CodeLocation,
    },

    #[error("a {kind} node may not be declared once the suite has started running (declared at {location})")]
    SuiteNodeDuringRunPhase {
        kind: NodeKind,
        location: CodeLocation,
    },

    #[error("there can only be one before-suite node: {kind} at {location} conflicts with {existing_kind} at {existing_location}")]
    MultipleBeforeSuiteNodes {
        kind: NodeKind,
        location: CodeLocation,
        existing_kind: NodeKind,
        existing_location: CodeLocation,
    },

    #[error("there can only be one after-suite node: {kind} at {location} conflicts with {existing_kind} at {existing_location}")]
    MultipleAfterSuiteNodes {
        kind: NodeKind,
        location: CodeLocation,
        existing_kind: NodeKind,
        existing_location: CodeLocation,
    },

    #[error("cleanup callbacks may only be registered while a node is running (registered at {location})")]
    PushingCleanupNodeDuringTreeConstruction { location: CodeLocation },

    #[error("cleanup callbacks may not be registered inside a {kind} node (registered at {location})")]
    PushingCleanupInReportNode {
        kind: NodeKind,
        location: CodeLocation,
    },

    #[error("cleanup callbacks may not be registered inside another cleanup callback (registered at {location})")]
    PushingCleanupInCleanupNode { location: CodeLocation },

    #[error("a panic occurred while building the spec tree at {location}: {panic_value}")]
    CaughtPanicDuringBuildPhase {
        panic_value: String,
        location: CodeLocation,
    },

    #[error("report entries may only be added while the suite is running (added at {location})")]
    AddReportEntryNotDuringRunPhase { location: CodeLocation },

    #[error("SynchronizedBeforeSuite failed on the primary process")]
    SynchronizedBeforeSuiteFailedOnPrimary,

    #[error("cannot run the suite before the tree has been built; call build_tree() first")]
    RunBeforeBuildTree,
}

/// Failures surfaced by the inter-process coordination client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("coordination client transport failure: {0}")]
    Transport(String),

    #[error("the coordination server is shutting down")]
    ShutDown,

    #[error("parallel mode requires a coordination client")]
    Missing,
}
