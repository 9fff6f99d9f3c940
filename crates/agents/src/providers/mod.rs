pub mod echo;

use std::sync::Arc;

use crate::model::LlmProvider;

pub use echo::EchoProvider;

/// Providers available to chat runs, first registered is the default.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding only the built-in [`EchoProvider`].
    pub fn with_echo() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EchoProvider::new()));
        registry
    }

    /// A provider with an already registered id replaces the old one in place.
    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) {
        match self.providers.iter().position(|p| p.id() == provider.id()) {
            Some(i) => self.providers[i] = provider,
            None => self.providers.push(provider),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.iter().find(|p| p.id() == id).cloned()
    }

    pub fn first(&self) -> Option<Arc<dyn LlmProvider>> {
        self.providers.first().cloned()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.id()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// One-line summary for the startup banner.
    pub fn provider_summary(&self) -> String {
        if self.providers.is_empty() {
            return "none".into();
        }
        self.providers
            .iter()
            .map(|p| format!("{}/{}", p.name(), p.id()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_registered_is_default() {
        let registry = ProviderRegistry::with_echo();
        assert_eq!(registry.first().unwrap().id(), "echo");
        assert!(registry.get("gpt-4o").is_none());
        assert_eq!(registry.provider_summary(), "echo/echo");
        assert_eq!(ProviderRegistry::new().provider_summary(), "none");
    }

    #[test]
    fn reregistering_replaces() {
        let mut registry = ProviderRegistry::with_echo();
        registry.register(Arc::new(EchoProvider::new()));
        assert_eq!(registry.ids(), ["echo"]);
    }
}
