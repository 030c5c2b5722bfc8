//! Compiled plan cache keyed by definition content hash.

use std::sync::Arc;

use dashmap::DashMap;
use weaver_types::workflow::WorkflowDefinition;

use super::compiler::{compile_with, CompileError, CompileOptions, CompiledPlan};
use super::definition::definition_hash;

/// Shares compiled plans between executions of the same definition.
///
/// Plans are immutable once compiled, so entries are never invalidated; a
/// changed definition hashes to a new key.
#[derive(Debug, Default)]
pub struct PlanCache {
    plans: DashMap<String, Arc<CompiledPlan>>,
}

impl PlanCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compile(
        &self,
        definition: &WorkflowDefinition,
        options: CompileOptions,
    ) -> Result<Arc<CompiledPlan>, CompileError> {
        let key = format!(
            "{}:{}",
            definition_hash(definition),
            options.default_max_iterations
        );
        if let Some(plan) = self.plans.get(&key) {
            tracing::debug!(workflow = definition.name.as_str(), "plan cache hit");
            return Ok(Arc::clone(plan.value()));
        }
        let plan = Arc::new(compile_with(definition, &options)?);
        self.plans.insert(key, Arc::clone(&plan));
        Ok(plan)
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    pub fn clear(&self) {
        self.plans.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition(name: &str) -> WorkflowDefinition {
        serde_json::from_value(json!({
            "name": name,
            "entryPoint": "a",
            "nodes": { "a": { "type": "input", "name": "A" } }
        }))
        .unwrap()
    }

    #[test]
    fn same_definition_shares_plan() {
        let cache = PlanCache::new();
        let first = cache.get_or_compile(&definition("one"), CompileOptions::default()).unwrap();
        let second = cache.get_or_compile(&definition("one"), CompileOptions::default()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        cache.get_or_compile(&definition("two"), CompileOptions::default()).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn compile_errors_are_not_cached() {
        let cache = PlanCache::new();
        let mut def = definition("bad");
        def.entry_point = "missing".to_string();
        assert!(cache.get_or_compile(&def, CompileOptions::default()).is_err());
        assert!(cache.is_empty());
    }
}
