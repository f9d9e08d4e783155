//! Language provider capability and the binding router.
//!
//! The engine never talks to a model endpoint directly; agents go through a
//! [`LanguageProvider`] resolved from an [`LlmRouter`] binding. Transport
//! details live in the provider implementations.

pub mod mock;
pub mod openai;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::error::EngineError;
use crate::core::types::Scene;

pub use mock::MockProvider;
pub use openai::OpenAiCompatProvider;

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionOutput {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Copy)]
pub struct CompletionOptions {
    pub timeout_ms: u64,
    pub temperature: Option<f32>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            temperature: None,
        }
    }
}

/// Capability contract for a chat-completion backend. Implementations may
/// fail with `LLM_UNAVAILABLE` (transport) or `LLM_PROTOCOL` (malformed
/// reply) and must respect the per-call timeout.
#[async_trait]
pub trait LanguageProvider: Send + Sync + std::fmt::Debug {
    fn provider_id(&self) -> &str;

    async fn complete(
        &self,
        messages: &[ChatMessage],
        opts: &CompletionOptions,
    ) -> Result<CompletionOutput, EngineError>;
}

/// A named binding from an id to a provider. Scenes may carry a default
/// binding; the router-wide default backstops both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmBinding {
    pub id: String,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub is_default: bool,
}

pub struct LlmRouter {
    providers: std::sync::RwLock<HashMap<String, Arc<dyn LanguageProvider>>>,
    scene_bindings: std::sync::RwLock<HashMap<Scene, String>>,
    default_binding: std::sync::RwLock<Option<String>>,
}

impl LlmRouter {
    pub fn new() -> Self {
        Self {
            providers: std::sync::RwLock::new(HashMap::new()),
            scene_bindings: std::sync::RwLock::new(HashMap::new()),
            default_binding: std::sync::RwLock::new(None),
        }
    }

    pub fn register(&self, binding_id: impl Into<String>, provider: Arc<dyn LanguageProvider>) {
        let binding_id = binding_id.into();
        info!(binding = %binding_id, provider = provider.provider_id(), "registered LLM binding");
        let mut providers = self
            .providers
            .write()
            .unwrap_or_else(|p| p.into_inner());
        let first = providers.is_empty();
        providers.insert(binding_id.clone(), provider);
        drop(providers);
        if first {
            self.set_default(&binding_id);
        }
    }

    pub fn set_default(&self, binding_id: &str) {
        *self
            .default_binding
            .write()
            .unwrap_or_else(|p| p.into_inner()) = Some(binding_id.to_string());
    }

    pub fn bind_scene(&self, scene: Scene, binding_id: &str) {
        self.scene_bindings
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(scene, binding_id.to_string());
    }

    /// Resolution order: explicit binding id, then the scene's binding, then
    /// the router-wide default.
    pub fn resolve(
        &self,
        binding_id: Option<&str>,
        scene: Scene,
    ) -> Result<Arc<dyn LanguageProvider>, EngineError> {
        let id = match binding_id {
            Some(id) => id.to_string(),
            None => {
                let scene_binding = self
                    .scene_bindings
                    .read()
                    .unwrap_or_else(|p| p.into_inner())
                    .get(&scene)
                    .cloned();
                match scene_binding {
                    Some(id) => id,
                    None => self
                        .default_binding
                        .read()
                        .unwrap_or_else(|p| p.into_inner())
                        .clone()
                        .ok_or_else(|| {
                            EngineError::Validation(
                                "no LLM binding configured for this scene and no default set"
                                    .to_string(),
                            )
                        })?,
                }
            }
        };

        self.providers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::Validation(format!("unknown LLM binding '{id}'")))
    }
}

impl Default for LlmRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolution_order_explicit_scene_default() {
        let router = LlmRouter::new();
        let a = Arc::new(MockProvider::with_replies(["a"]));
        let b = Arc::new(MockProvider::with_replies(["b"]));
        router.register("binding-a", a);
        router.register("binding-b", b);
        router.set_default("binding-a");
        router.bind_scene(Scene::Dashboard, "binding-b");

        let opts = CompletionOptions::default();
        let explicit = router.resolve(Some("binding-b"), Scene::DataDiscuss).unwrap();
        assert_eq!(
            explicit.complete(&[], &opts).await.unwrap().text,
            "b".to_string()
        );

        let scene = router.resolve(None, Scene::Dashboard).unwrap();
        let _ = scene; // bound to binding-b

        let fallback = router.resolve(None, Scene::LoanOps).unwrap();
        assert_eq!(fallback.provider_id(), "mock");
    }

    #[test]
    fn missing_binding_is_validation_error() {
        let router = LlmRouter::new();
        let err = router.resolve(None, Scene::DataDiscuss).unwrap_err();
        assert_eq!(err.kind(), crate::core::error::ErrorKind::Validation);
    }
}
