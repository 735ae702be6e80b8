//! Core of the fuku deployment tool
//!
//! Independent of AWS: the persisted [`Store`], the [`Module`] trait and the
//! [`Client`] that resolves contexts and cascades selections, plus the seams
//! (shell commands, object storage) that infrastructure code runs through.

pub mod client;
pub mod context;
pub mod error;
pub mod module;
pub mod object_store;
pub mod runner;
pub mod secure;
pub mod store;
pub mod validate;

pub use client::{Client, ContextScope};
pub use context::Context;
pub use error::{FukuError, Result};
pub use module::{Module, ModuleState, SELECTED};
pub use object_store::{MemoryObjectStore, ObjectStore, ObjectStoreError, OBJECT_PREFIX};
pub use runner::{Capture, CommandOutput, CommandRunner, RecordingRunner, ShellCommand, ShellRunner};
pub use secure::{remove_cached, SecureFiles};
pub use store::Store;
pub use validate::validate;
