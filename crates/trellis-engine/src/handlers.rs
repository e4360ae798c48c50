use std::collections::HashMap;
use std::sync::Arc;

use trellis_core::traits::NodeHandler;

/// Registry of node handlers, keyed by handler name.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler.
    pub fn register(&mut self, handler: impl NodeHandler) {
        let name = handler.name().to_string();
        self.handlers.insert(name, Arc::new(handler));
    }

    /// Register an already-shared handler.
    pub fn register_arc(&mut self, handler: Arc<dyn NodeHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    /// Unregister a handler by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.handlers.remove(name).is_some()
    }

    /// Get a handler by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(name).cloned()
    }

    /// List all registered handler names.
    pub fn list(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use trellis_core::error::Result;
    use trellis_core::types::{NodeContext, NodeOutcome};

    struct Echo;

    impl NodeHandler for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn execute(&self, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutcome>> {
            Box::pin(async move { Ok(NodeOutcome::text(ctx.node_id)) })
        }
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = HandlerRegistry::new();
        registry.register(Echo);

        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.list(), vec!["echo"]);

        assert!(registry.unregister("echo"));
        assert!(!registry.unregister("echo"));
    }
}
