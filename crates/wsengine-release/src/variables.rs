//! Variable resolution for one release target.

use std::collections::BTreeMap;

use tracing::debug;

use wsengine_core::{
    DeploymentVariable, DeploymentVariableValue, EngineError, EngineResult, Environment,
    LiteralValue, Resource, SelectorEntity, VariableValue,
};
use wsengine_store::Store;
use wsengine_store::relationships::property_value;

/// Resolve every variable the deployment declares for `(resource,
/// environment)`. Precedence per key: resource variable, then the
/// highest-priority matching deployment value, then the declared default.
/// Keys with no value are omitted.
pub fn resolve_variables(
    store: &Store,
    deployment_id: &str,
    resource: &Resource,
    environment: &Environment,
) -> EngineResult<BTreeMap<String, LiteralValue>> {
    let mut declared = store.variables_for_deployment(deployment_id);
    declared.sort_by(|a, b| a.key.cmp(&b.key));

    let overrides: BTreeMap<String, LiteralValue> = store
        .resource_variables_for(&resource.id)
        .into_iter()
        .map(|v| (v.key, v.value))
        .collect();

    let mut resolver = Resolver {
        store,
        resource,
        environment,
        related: None,
    };
    let mut resolved = BTreeMap::new();
    for variable in &declared {
        if let Some(value) = overrides.get(&variable.key) {
            resolved.insert(variable.key.clone(), value.clone());
            continue;
        }
        if let Some(value) = resolver.scoped_value(variable)? {
            resolved.insert(variable.key.clone(), value);
            continue;
        }
        if let Some(default) = &variable.default_value {
            resolved.insert(variable.key.clone(), default.clone());
        }
    }
    Ok(resolved)
}

struct Resolver<'a> {
    store: &'a Store,
    resource: &'a Resource,
    environment: &'a Environment,
    /// Computed on the first reference value.
    related: Option<BTreeMap<String, Resource>>,
}

impl Resolver<'_> {
    fn scoped_value(&mut self, variable: &DeploymentVariable) -> EngineResult<Option<LiteralValue>> {
        let mut values = self.store.values_for_variable(&variable.id);
        values.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));

        for value in &values {
            if !self.matches(value)? {
                continue;
            }
            match &value.value {
                VariableValue::Literal { value } => return Ok(Some(value.clone())),
                VariableValue::Reference { reference, path } => {
                    if let Some(resolved) = self.reference(reference, path)? {
                        return Ok(Some(resolved));
                    }
                    debug!(
                        variable = %variable.key,
                        reference = %reference,
                        resource = %self.resource.id,
                        "reference unresolved, falling through"
                    );
                }
            }
        }
        Ok(None)
    }

    fn matches(&self, value: &DeploymentVariableValue) -> EngineResult<bool> {
        let selectors = self.store.selectors();
        Ok(selectors.matches_opt(
            value.resource_selector.as_ref(),
            &SelectorEntity::Resource(self.resource),
        )? && selectors.matches_opt(
            value.environment_selector.as_ref(),
            &SelectorEntity::Environment(self.environment),
        )?)
    }

    fn reference(&mut self, reference: &str, path: &[String]) -> EngineResult<Option<LiteralValue>> {
        if self.related.is_none() {
            self.related = Some(self.store.related_resources(&self.resource.id)?);
        }
        let Some(target) = self.related.as_ref().and_then(|r| r.get(reference)) else {
            return Ok(None);
        };
        let doc = serde_json::to_value(target)
            .map_err(|e| EngineError::Evaluator(format!("resource {}: {e}", target.id)))?;
        Ok(property_value(&doc, path).and_then(LiteralValue::from_json))
    }
}
