//! Module registry, context resolution and selection cascades

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::context::Context;
use crate::error::{FukuError, Result};
use crate::module::{Module, ModuleState, SELECTED};
use crate::store::Store;

/// How much of a module's own state participates in context resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextScope {
    /// Dependencies followed by the module's own contribution
    Full,
    /// Dependencies only; the module's own keys are left out
    DependenciesOnly,
}

pub struct Client {
    modules: Vec<Box<dyn Module>>,
    store: Store,
    overrides: Context,
}

impl Client {
    pub fn new(store: Store) -> Self {
        Self {
            modules: Vec::new(),
            store,
            overrides: Context::new(),
        }
    }

    /// Values given on the command line that modules may prefer over their
    /// stored selection (e.g. `--app`).
    pub fn with_overrides(mut self, overrides: Context) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn add_module(&mut self, module: Box<dyn Module>) -> Result<()> {
        if self.modules.iter().any(|m| m.name() == module.name()) {
            return Err(FukuError::DuplicateModule(module.name().to_string()));
        }
        debug!(module = module.name(), "registered module");
        self.modules.push(module);
        Ok(())
    }

    pub fn modules(&self) -> impl Iterator<Item = &dyn Module> {
        self.modules.iter().map(|m| m.as_ref())
    }

    pub fn module(&self, name: &str) -> Result<&dyn Module> {
        self.modules()
            .find(|m| m.name() == name)
            .ok_or_else(|| FukuError::UnknownModule(name.to_string()))
    }

    /// Registered modules that list `name` among their dependencies.
    pub fn parent_modules<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a dyn Module> {
        self.modules()
            .filter(move |m| m.dependencies().iter().any(|dep| *dep == name))
    }

    /// Registered modules named in `module`'s dependencies, in declaration
    /// order. Names with no registered module are skipped.
    pub fn dependent_modules<'a>(
        &'a self,
        module: &'a dyn Module,
    ) -> impl Iterator<Item = &'a dyn Module> {
        module
            .dependencies()
            .iter()
            .filter_map(move |dep| self.module(dep).ok())
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    pub fn save(&self) -> Result<()> {
        self.store.save()
    }

    /// Full context of `name`: every dependency first, then its own keys.
    pub fn context(&self, name: &str) -> Result<Context> {
        self.context_with(name, Context::new(), ContextScope::Full)
    }

    /// Context of `name` without its own contribution.
    pub fn dependency_context(&self, name: &str) -> Result<Context> {
        self.context_with(name, Context::new(), ContextScope::DependenciesOnly)
    }

    /// Resolve the context of `name` on top of `seed`. Dependencies are always
    /// resolved with their full scope.
    pub fn context_with(&self, name: &str, seed: Context, scope: ContextScope) -> Result<Context> {
        let module = self.module(name)?;
        let mut ctx = seed;
        for dep in self.dependent_modules(module) {
            ctx = self.context_with(dep.name(), ctx, ContextScope::Full)?;
        }
        if scope == ContextScope::Full {
            let state = ModuleState::new(module.name(), &self.store, &self.overrides);
            ctx.merge(module.my_context(&state)?);
        }
        debug!(module = name, context = %ctx, "resolved context");
        Ok(ctx)
    }

    pub fn selected(&self, name: &str) -> Option<&str> {
        self.store.get_str(name, SELECTED)
    }

    /// Persist (or clear, with `None`) the selection of `name` and clear the
    /// selections of every selectable module that depends on it.
    ///
    /// Dependents are torn down first so their de-selection hooks still see
    /// the upstream selection they were made under.
    pub fn select(&mut self, name: &str, value: Option<&str>) -> Result<()> {
        let module = self.module(name)?;
        if !module.selectable() {
            return Err(FukuError::NotSelectable(name.to_string()));
        }
        let module_name = module.name();

        self.clear_parent_selections(module_name)?;

        if let Some(previous) = self.selected(module_name).map(str::to_string) {
            if value != Some(previous.as_str()) {
                let ctx = match self.dependency_context(module_name) {
                    Ok(ctx) => ctx,
                    Err(err) => {
                        debug!(module = module_name, error = %err, "no dependency context for de-selection");
                        Context::new()
                    }
                };
                self.module(module_name)?.on_deselect(&previous, &ctx)?;
            }
        }

        match value {
            Some(value) => {
                self.store.set(module_name, SELECTED, value);
                info!(module = module_name, selected = value, "selected");
            }
            None => {
                self.store.remove(module_name, SELECTED);
                debug!(module = module_name, "cleared selection");
            }
        }
        Ok(())
    }

    pub fn deselect(&mut self, name: &str) -> Result<()> {
        self.select(name, None)
    }

    /// Clear the selection of every module depending on `name`. Modules that do
    /// not support selection are skipped.
    pub fn clear_parent_selections(&mut self, name: &str) -> Result<()> {
        debug!(module = name, "clearing parent selections");
        let parents: Vec<(&'static str, bool)> = self
            .parent_modules(name)
            .map(|m| (m.name(), m.selectable()))
            .collect();
        for (parent, selectable) in parents {
            if selectable {
                self.select(parent, None)?;
            }
        }
        Ok(())
    }

    /// Capture every module's persisted keys, keyed by module name.
    pub fn snapshot(&self) -> Map<String, Value> {
        let mut snapshot = Map::new();
        for module in self.modules() {
            let mut state = Map::new();
            for key in module.persisted_keys() {
                if let Some(value) = self.store.get(module.name(), key) {
                    state.insert((*key).to_string(), value.clone());
                }
            }
            if !state.is_empty() {
                snapshot.insert(module.name().to_string(), Value::Object(state));
            }
        }
        snapshot
    }

    /// Restore persisted keys from a snapshot. Keys absent from the snapshot
    /// are removed. No cascade runs.
    pub fn restore(&mut self, snapshot: &Map<String, Value>) {
        let plan: Vec<(&'static str, &'static [&'static str])> = self
            .modules()
            .map(|m| (m.name(), m.persisted_keys()))
            .collect();
        for (name, keys) in plan {
            let saved = snapshot.get(name).and_then(Value::as_object);
            for key in keys {
                match saved.and_then(|s| s.get(*key)) {
                    Some(value) => self.store.set(name, key, value.clone()),
                    None => self.store.remove(name, key),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Selectable {
        name: &'static str,
        deps: &'static [&'static str],
        key: &'static str,
        hooks: Arc<Mutex<Vec<String>>>,
    }

    impl Module for Selectable {
        fn name(&self) -> &'static str {
            self.name
        }

        fn dependencies(&self) -> &'static [&'static str] {
            self.deps
        }

        fn my_context(&self, state: &ModuleState<'_>) -> Result<Context> {
            let selected = state
                .selected()
                .ok_or_else(|| FukuError::usage(format!("no {} currently selected", self.name)))?;
            Ok(Context::new().with(self.key, selected))
        }

        fn selectable(&self) -> bool {
            true
        }

        fn on_deselect(&self, previous: &str, context: &Context) -> Result<()> {
            self.hooks
                .lock()
                .push(format!("{}:{}:{}", self.name, previous, context));
            Ok(())
        }
    }

    struct Plain {
        name: &'static str,
        deps: &'static [&'static str],
    }

    impl Module for Plain {
        fn name(&self) -> &'static str {
            self.name
        }

        fn dependencies(&self) -> &'static [&'static str] {
            self.deps
        }
    }

    fn selectable(
        name: &'static str,
        deps: &'static [&'static str],
        key: &'static str,
        hooks: &Arc<Mutex<Vec<String>>>,
    ) -> Box<dyn Module> {
        Box::new(Selectable {
            name,
            deps,
            key,
            hooks: hooks.clone(),
        })
    }

    /// region <- cluster <- app <- db, with a non-selectable task between app and worker
    fn client() -> (Client, Arc<Mutex<Vec<String>>>) {
        let hooks = Arc::new(Mutex::new(Vec::new()));
        let mut client = Client::new(Store::in_memory());
        client.add_module(selectable("region", &[], "region", &hooks)).unwrap();
        client
            .add_module(selectable("cluster", &["region"], "cluster", &hooks))
            .unwrap();
        client
            .add_module(selectable("app", &["cluster"], "app", &hooks))
            .unwrap();
        client
            .add_module(selectable("db", &["app"], "db", &hooks))
            .unwrap();
        client
            .add_module(Box::new(Plain {
                name: "task",
                deps: &["app"],
            }))
            .unwrap();
        client
            .add_module(selectable("worker", &["task"], "worker", &hooks))
            .unwrap();
        (client, hooks)
    }

    #[test]
    fn test_duplicate_module_rejected() {
        let (mut client, hooks) = client();
        let err = client
            .add_module(selectable("app", &[], "app", &hooks))
            .unwrap_err();
        assert!(matches!(err, FukuError::DuplicateModule(name) if name == "app"));
    }

    #[test]
    fn test_parent_and_dependent_modules() {
        let (client, _) = client();
        let parents: Vec<&str> = client.parent_modules("app").map(|m| m.name()).collect();
        assert_eq!(parents, vec!["db", "task"]);

        let app = client.module("app").unwrap();
        let deps: Vec<&str> = client.dependent_modules(app).map(|m| m.name()).collect();
        assert_eq!(deps, vec!["cluster"]);
    }

    #[test]
    fn test_unregistered_dependencies_are_skipped() {
        let mut client = Client::new(Store::in_memory());
        client
            .add_module(Box::new(Plain {
                name: "orphan",
                deps: &["missing", "also-missing"],
            }))
            .unwrap();
        let orphan = client.module("orphan").unwrap();
        assert_eq!(client.dependent_modules(orphan).count(), 0);
        assert!(client.context("orphan").unwrap().is_empty());
    }

    #[test]
    fn test_context_includes_dependencies() {
        let (mut client, _) = client();
        client.store_mut().set("region", SELECTED, "ap-southeast-2");
        client.store_mut().set("cluster", SELECTED, "prod");
        client.store_mut().set("app", SELECTED, "api");

        let ctx = client.context("app").unwrap();
        assert_eq!(ctx.get("region"), Some("ap-southeast-2"));
        assert_eq!(ctx.get("cluster"), Some("prod"));
        assert_eq!(ctx.get("app"), Some("api"));

        let deps = client.dependency_context("app").unwrap();
        assert_eq!(deps.get("cluster"), Some("prod"));
        assert!(!deps.contains_key("app"));
    }

    #[test]
    fn test_context_fails_without_upstream_selection() {
        let (mut client, _) = client();
        client.store_mut().set("region", SELECTED, "ap-southeast-2");
        let err = client.context("app").unwrap_err();
        assert_eq!(err.to_string(), "no cluster currently selected");
    }

    #[test]
    fn test_select_cascades_transitively() {
        let (mut client, _) = client();
        client.select("region", Some("ap-southeast-2")).unwrap();
        client.select("cluster", Some("prod")).unwrap();
        client.select("app", Some("api")).unwrap();
        client.select("db", Some("main")).unwrap();

        client.deselect("cluster").unwrap();

        assert_eq!(client.selected("region"), Some("ap-southeast-2"));
        assert_eq!(client.selected("cluster"), None);
        assert_eq!(client.selected("app"), None);
        assert_eq!(client.selected("db"), None);
    }

    #[test]
    fn test_cascade_stops_at_unselectable_module() {
        let (mut client, _) = client();
        client.select("region", Some("ap-southeast-2")).unwrap();
        client.select("cluster", Some("prod")).unwrap();
        client.select("app", Some("api")).unwrap();
        client.store_mut().set("worker", SELECTED, "w1");

        client.select("app", Some("web")).unwrap();

        assert_eq!(client.selected("app"), Some("web"));
        assert_eq!(client.selected("worker"), Some("w1"));
    }

    #[test]
    fn test_deselect_hooks_see_previous_upstream() {
        let (mut client, hooks) = client();
        client.select("region", Some("ap-southeast-2")).unwrap();
        client.select("cluster", Some("prod")).unwrap();
        client.select("app", Some("api")).unwrap();
        client.select("db", Some("main")).unwrap();
        hooks.lock().clear();

        client.select("cluster", Some("staging")).unwrap();

        let calls = hooks.lock().clone();
        assert_eq!(
            calls,
            vec![
                "db:main:{app=api, cluster=prod, region=ap-southeast-2}".to_string(),
                "app:api:{cluster=prod, region=ap-southeast-2}".to_string(),
                "cluster:prod:{region=ap-southeast-2}".to_string(),
            ]
        );
        assert_eq!(client.selected("cluster"), Some("staging"));
    }

    #[test]
    fn test_reselecting_same_value_skips_own_hook() {
        let (mut client, hooks) = client();
        client.select("region", Some("ap-southeast-2")).unwrap();
        client.select("cluster", Some("prod")).unwrap();
        hooks.lock().clear();

        client.select("cluster", Some("prod")).unwrap();
        assert!(hooks.lock().is_empty());
    }

    #[test]
    fn test_select_unselectable_module() {
        let (mut client, _) = client();
        let err = client.select("task", Some("web")).unwrap_err();
        assert!(matches!(err, FukuError::NotSelectable(name) if name == "task"));
    }

    #[test]
    fn test_overrides_visible_to_modules() {
        struct Overridable;
        impl Module for Overridable {
            fn name(&self) -> &'static str {
                "app"
            }
            fn my_context(&self, state: &ModuleState<'_>) -> Result<Context> {
                let app = state
                    .override_value("app")
                    .or_else(|| state.selected())
                    .ok_or_else(|| FukuError::usage("no app currently selected"))?;
                Ok(Context::new().with("app", app))
            }
        }

        let mut client =
            Client::new(Store::in_memory()).with_overrides(Context::new().with("app", "cli"));
        client.add_module(Box::new(Overridable)).unwrap();
        client.store_mut().set("app", SELECTED, "stored");
        assert_eq!(client.context("app").unwrap().get("app"), Some("cli"));
    }

    #[test]
    fn test_snapshot_and_restore() {
        let (mut client, _) = client();
        client.select("region", Some("ap-southeast-2")).unwrap();
        client.select("cluster", Some("prod")).unwrap();
        let snapshot = client.snapshot();

        client.select("cluster", Some("staging")).unwrap();
        client.select("app", Some("api")).unwrap();

        client.restore(&snapshot);
        assert_eq!(client.selected("cluster"), Some("prod"));
        assert_eq!(client.selected("app"), None);
    }
}
