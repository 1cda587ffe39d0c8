use std::{collections::BTreeMap, fmt, sync::Arc};

use crate::{error::TemplateResult, runtime::CustomCall};

/// A directive kind supplied by the embedding application.
///
/// Block-opening custom nodes take part in the same `@end` protocol as the
/// built-in blocks: their body is available through
/// [`CustomCall::render_body`].
pub trait CustomNode: fmt::Debug + Send + Sync {
    fn is_block_opening(&self) -> bool {
        false
    }

    fn eval(&self, call: &mut CustomCall<'_, '_>) -> TemplateResult<()>;
}

/// Builds a custom node from the directive body. An `Err` aborts compilation.
pub type CustomNodeFactory =
    Arc<dyn Fn(&str) -> Result<Box<dyn CustomNode>, String> + Send + Sync>;

/// Maps directive names to custom node factories.
#[derive(Clone, Default)]
pub struct ExtensionRegistry {
    factories: BTreeMap<String, CustomNodeFactory>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<N, F>(&mut self, name: N, factory: F) -> &mut Self
    where
        N: Into<String>,
        F: Fn(&str) -> Result<Box<dyn CustomNode>, String> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn get(&self, name: &str) -> Option<&CustomNodeFactory> {
        self.factories.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}
