use std::{collections::HashMap, sync::Arc};

use crate::{
    Result, WorkerErr,
    model::{Criterion, Linear, Model, Mse},
};

/// Resolves the model and criterion identifiers carried by a `StepSpec`.
#[derive(Clone, Default)]
pub struct Registry {
    models: HashMap<String, Arc<dyn Model>>,
    criteria: HashMap<String, Arc<dyn Criterion>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in `linear` model and `mse` criterion.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_model("linear", Linear);
        registry.register_criterion("mse", Mse);
        registry
    }

    /// Registers `model` under `kind`, replacing any previous one.
    pub fn register_model<M: Model + 'static>(&mut self, kind: impl Into<String>, model: M) {
        self.models.insert(kind.into(), Arc::new(model));
    }

    /// Registers `criterion` under `kind`, replacing any previous one.
    pub fn register_criterion<C: Criterion + 'static>(
        &mut self,
        kind: impl Into<String>,
        criterion: C,
    ) {
        self.criteria.insert(kind.into(), Arc::new(criterion));
    }

    pub fn model(&self, kind: &str) -> Result<Arc<dyn Model>> {
        self.models
            .get(kind)
            .cloned()
            .ok_or_else(|| WorkerErr::UnknownModel { kind: kind.into() })
    }

    pub fn criterion(&self, kind: &str) -> Result<Arc<dyn Criterion>> {
        self.criteria
            .get(kind)
            .cloned()
            .ok_or_else(|| WorkerErr::UnknownCriterion { kind: kind.into() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_resolve() {
        let registry = Registry::with_builtins();
        assert!(registry.model("linear").is_ok());
        assert!(registry.criterion("mse").is_ok());
    }

    #[test]
    fn unknown_kinds_are_errors() {
        let registry = Registry::new();
        assert!(matches!(
            registry.model("linear"),
            Err(WorkerErr::UnknownModel { .. })
        ));
        assert!(matches!(
            registry.criterion("mse"),
            Err(WorkerErr::UnknownCriterion { .. })
        ));
    }
}
