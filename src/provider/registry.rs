// src/provider/registry.rs — Provider lookup by id
//
// Built once at startup. Task bindings name a provider id; the id is
// resolved here at creation time and again by the worker, never re-chosen.

use std::collections::HashMap;
use std::sync::Arc;

use super::async_job::AsyncJobProvider;
use super::openai_chat::OpenAIChatProvider;
use super::openai_images::OpenAIImagesProvider;
use super::timeout::TimeoutProvider;
use super::GenerationProvider;
use crate::core::types::{ProviderBinding, TaskKind};
use crate::infra::config::{AdapterKind, ProviderConfig};
use crate::infra::errors::GenTaskError;

#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn GenerationProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a provider under its own id.
    pub fn register(&mut self, provider: Arc<dyn GenerationProvider>) {
        self.providers.insert(provider.id().to_string(), provider);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn GenerationProvider>> {
        self.providers.get(id).cloned()
    }

    /// The provider for a binding, if it exists and serves `kind`.
    pub fn resolve(
        &self,
        binding: &ProviderBinding,
        kind: TaskKind,
    ) -> Result<Arc<dyn GenerationProvider>, GenTaskError> {
        let provider = self.get(&binding.provider).ok_or_else(|| {
            GenTaskError::Validation(format!("unknown provider '{}'", binding.provider))
        })?;
        if !provider.supports(kind) {
            return Err(GenTaskError::Validation(format!(
                "provider '{}' does not generate {kind}",
                binding.provider
            )));
        }
        Ok(provider)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Instantiate every configured provider, each behind its call timeout.
    pub fn from_config(configs: &[ProviderConfig]) -> Result<Self, GenTaskError> {
        let mut registry = Self::new();
        for cfg in configs {
            let provider = build_provider(cfg)?;
            tracing::info!(provider = %cfg.id, adapter = ?cfg.adapter, timeout_secs = cfg.timeout_secs, "Registered provider");
            registry.register(Arc::new(TimeoutProvider::new(provider, cfg.timeout())));
        }
        Ok(registry)
    }
}

fn build_provider(cfg: &ProviderConfig) -> Result<Arc<dyn GenerationProvider>, GenTaskError> {
    let api_key = cfg.api_key();
    if api_key.is_none() {
        if let Some(ref var) = cfg.api_key_env {
            tracing::warn!(provider = %cfg.id, env = %var, "API key variable is unset");
        }
    }

    let provider: Arc<dyn GenerationProvider> = match cfg.adapter {
        AdapterKind::OpenaiImages => {
            let mut p = match cfg.base_url {
                Some(ref url) => OpenAIImagesProvider::with_base_url(&cfg.id, api_key, url.clone()),
                None => OpenAIImagesProvider::new(&cfg.id, api_key),
            }
            .with_partial_batch(cfg.partial_batch);
            if let Some(ref name) = cfg.name {
                p = p.with_name(name);
            }
            Arc::new(p)
        }
        AdapterKind::OpenaiChat => {
            let mut p = match cfg.base_url {
                Some(ref url) => OpenAIChatProvider::with_base_url(&cfg.id, api_key, url.clone()),
                None => OpenAIChatProvider::new(&cfg.id, api_key),
            };
            if let Some(ref name) = cfg.name {
                p = p.with_name(name);
            }
            Arc::new(p)
        }
        AdapterKind::AsyncJob => {
            let base_url = cfg.base_url.clone().ok_or_else(|| {
                GenTaskError::Config(format!("provider '{}' needs base_url", cfg.id))
            })?;
            let mut p = AsyncJobProvider::new(
                &cfg.id,
                base_url,
                api_key,
                cfg.job.clone().unwrap_or_default(),
            )
            .with_kinds(cfg.kinds.clone())
            .with_partial_batch(cfg.partial_batch);
            if let Some(ref name) = cfg.name {
                p = p.with_name(name);
            }
            Arc::new(p)
        }
    };
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(toml_str: &str) -> Vec<ProviderConfig> {
        let c: crate::infra::config::Config = toml::from_str(toml_str).unwrap();
        c.providers
    }

    #[test]
    fn test_from_config_registers_all() {
        let registry = ProviderRegistry::from_config(&config(
            r#"
[[providers]]
id = "openai"
adapter = "openai_images"

[[providers]]
id = "writer"
adapter = "openai_chat"
name = "Writer"

[[providers]]
id = "kling"
adapter = "async_job"
base_url = "https://api.kling.example"
"#,
        ))
        .unwrap();
        assert_eq!(registry.ids(), vec!["kling", "openai", "writer"]);
        assert_eq!(registry.get("writer").unwrap().name(), "Writer");
    }

    #[test]
    fn test_resolve_checks_kind() {
        let registry = ProviderRegistry::from_config(&config(
            r#"
[[providers]]
id = "openai"
adapter = "openai_images"
"#,
        ))
        .unwrap();
        let image = ProviderBinding::new("openai", "dall-e-3");
        assert!(registry.resolve(&image, TaskKind::Image).is_ok());
        assert!(matches!(
            registry.resolve(&image, TaskKind::Video),
            Err(GenTaskError::Validation(_))
        ));
        let unknown = ProviderBinding::new("midjourney", "v6");
        let err = registry.resolve(&unknown, TaskKind::Image).err().unwrap();
        assert!(err.to_string().contains("midjourney"));
    }

    #[test]
    fn test_async_job_requires_base_url() {
        let result = ProviderRegistry::from_config(&config(
            r#"
[[providers]]
id = "kling"
adapter = "async_job"
"#,
        ));
        assert!(matches!(result, Err(GenTaskError::Config(_))));
    }
}
