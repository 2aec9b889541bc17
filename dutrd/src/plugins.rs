//! Extension module registry.
//!
//! Extensions expose one call surface: `call(method, json_args) ->
//! json_result`. The registry maps caller-supplied identifiers to
//! loaded modules and behaves as a set: registering an identifier twice
//! is an error, never a silent replacement. How a module's code gets
//! into the process (shared library, built-in, test stub) is the
//! loader's concern, behind this trait.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use dutr_common::AgentError;

/// A loaded extension: an opaque handle plus its instantiated object,
/// reachable only through the fixed call ABI.
pub trait ExtensionModule: Send + Sync {
    /// Invoke `method` with JSON-encoded arguments; returns a
    /// JSON-encoded result.
    fn call(&self, method: &str, json_args: &str) -> Result<String, AgentError>;
}

/// Identifier-to-module map with set semantics.
pub struct PluginRegistry {
    modules: RwLock<HashMap<String, Arc<dyn ExtensionModule>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            modules: RwLock::new(HashMap::new()),
        }
    }

    /// Register a module under `identifier`. Fails with
    /// `PluginConflict` when the identifier is taken.
    pub async fn register(
        &self,
        identifier: &str,
        module: Arc<dyn ExtensionModule>,
    ) -> Result<(), AgentError> {
        let mut modules = self.modules.write().await;
        if modules.contains_key(identifier) {
            return Err(AgentError::PluginConflict(identifier.to_string()));
        }
        modules.insert(identifier.to_string(), module);
        info!(identifier, "extension registered");
        Ok(())
    }

    /// Drop a module; unknown identifiers are reported.
    pub async fn unregister(&self, identifier: &str) -> Result<(), AgentError> {
        self.modules
            .write()
            .await
            .remove(identifier)
            .map(|_| ())
            .ok_or_else(|| AgentError::PluginMissing(identifier.to_string()))
    }

    /// Dispatch a call to a registered module.
    pub async fn call(
        &self,
        identifier: &str,
        method: &str,
        json_args: &str,
    ) -> Result<String, AgentError> {
        let module = self
            .modules
            .read()
            .await
            .get(identifier)
            .cloned()
            .ok_or_else(|| AgentError::PluginMissing(identifier.to_string()))?;
        module.call(method, json_args)
    }

    /// Registered identifiers, unordered.
    pub async fn names(&self) -> Vec<String> {
        self.modules.read().await.keys().cloned().collect()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoModule;

    impl ExtensionModule for EchoModule {
        fn call(&self, method: &str, json_args: &str) -> Result<String, AgentError> {
            Ok(format!(r#"{{"method":"{method}","args":{json_args}}}"#))
        }
    }

    #[tokio::test]
    async fn register_and_call() {
        let registry = PluginRegistry::new();
        registry.register("echo", Arc::new(EchoModule)).await.unwrap();

        let result = registry.call("echo", "Describe", "[1,2]").await.unwrap();
        assert_eq!(result, r#"{"method":"Describe","args":[1,2]}"#);
    }

    #[tokio::test]
    async fn duplicate_identifier_is_a_conflict() {
        let registry = PluginRegistry::new();
        registry.register("m", Arc::new(EchoModule)).await.unwrap();
        assert!(matches!(
            registry.register("m", Arc::new(EchoModule)).await,
            Err(AgentError::PluginConflict(_))
        ));
        // The original registration survives.
        assert_eq!(registry.names().await, vec!["m".to_string()]);
    }

    #[tokio::test]
    async fn missing_identifier_is_reported() {
        let registry = PluginRegistry::new();
        assert!(matches!(
            registry.call("ghost", "X", "null").await,
            Err(AgentError::PluginMissing(_))
        ));
        assert!(matches!(
            registry.unregister("ghost").await,
            Err(AgentError::PluginMissing(_))
        ));
    }

    #[tokio::test]
    async fn unregister_frees_the_identifier() {
        let registry = PluginRegistry::new();
        registry.register("m", Arc::new(EchoModule)).await.unwrap();
        registry.unregister("m").await.unwrap();
        registry.register("m", Arc::new(EchoModule)).await.unwrap();
    }
}
