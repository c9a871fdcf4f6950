//! A process virtual machine: a graph-based interpreter that walks activity
//! graphs with a tree of execution tokens.
//!
//! Process definitions are built with [`definition::builder::ProcessBuilder`]
//! or loaded from YAML, then executed by [`runtime::instance::ProcessInstance`]
//! directly or through the [`runtime::engine::ProcessEngine`] facade.

pub mod behaviors;
pub mod definition;
pub mod error;
pub mod runtime;

pub use error::{EngineError, Result};
