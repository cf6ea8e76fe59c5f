//! Pathway graph: the configured conversation flow.
//!
//! A pathway is a directed graph of `Node`s connected by `Edge`s. Nodes are
//! conversation turns, condition branches, external actions, or terminals.
//! Edge conditions are advisory labels shown to the controlling intelligence;
//! the engine never evaluates them. A `PathwayGraph` is built once from
//! configuration and is read-only afterwards, so many calls can share one
//! behind an `Arc`.

pub mod edge;
pub mod node;
pub mod pathway;

pub use edge::Edge;
pub use node::{Node, NodeKind};
pub use pathway::{PathwayConfig, PathwayGraph, PathwayWarning};
