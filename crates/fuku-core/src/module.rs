//! The module abstraction
//!
//! A module is one feature area of the CLI (cluster, app, task, ...). It names
//! the modules whose selections it needs, contributes its own keys to the
//! resolved [`Context`], and may keep a persisted "selected" resource.

use serde_json::Value;

use crate::context::Context;
use crate::error::Result;
use crate::store::Store;

/// Key under which a module records its currently selected resource
pub const SELECTED: &str = "selected";

pub trait Module: Send + Sync {
    /// Unique registry name; also the module's namespace in the store
    fn name(&self) -> &'static str;

    /// Modules whose context is resolved before this one, in order
    fn dependencies(&self) -> &'static [&'static str] {
        &[]
    }

    /// This module's own contribution to the context
    fn my_context(&self, _state: &ModuleState<'_>) -> Result<Context> {
        Ok(Context::new())
    }

    /// Whether the module keeps a selection that upstream changes invalidate
    fn selectable(&self) -> bool {
        false
    }

    /// Runs when a previous selection is about to be replaced or cleared.
    /// `context` is the module's dependency context before anything changes.
    fn on_deselect(&self, _previous: &str, _context: &Context) -> Result<()> {
        Ok(())
    }

    /// Store keys captured by session snapshots
    fn persisted_keys(&self) -> &'static [&'static str] {
        &[SELECTED]
    }
}

/// Read-only view of a module's persisted state while its context is built.
pub struct ModuleState<'a> {
    name: &'a str,
    store: &'a Store,
    overrides: &'a Context,
}

impl<'a> ModuleState<'a> {
    pub fn new(name: &'a str, store: &'a Store, overrides: &'a Context) -> Self {
        Self {
            name,
            store,
            overrides,
        }
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn get(&self, key: &str) -> Option<&'a Value> {
        self.store.get(self.name, key)
    }

    pub fn get_str(&self, key: &str) -> Option<&'a str> {
        self.store.get_str(self.name, key)
    }

    pub fn selected(&self) -> Option<&'a str> {
        self.get_str(SELECTED)
    }

    /// A value supplied on the command line for this invocation only
    pub fn override_value(&self, key: &str) -> Option<&'a str> {
        self.overrides.get(key)
    }
}
