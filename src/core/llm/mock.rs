//! Scripted provider for tests: replies are dequeued in order, prompts are
//! recorded for assertions. No network.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::error::EngineError;

use super::{ChatMessage, CompletionOptions, CompletionOutput, LanguageProvider};

#[derive(Default, Debug)]
pub struct MockProvider {
    replies: Mutex<VecDeque<Result<String, EngineError>>>,
    prompts: Mutex<Vec<String>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let provider = Self::default();
        for reply in replies {
            provider.push_reply(reply);
        }
        provider
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        self.replies
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(Ok(reply.into()));
    }

    pub fn push_failure(&self, err: EngineError) {
        self.replies
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(Err(err));
    }

    /// Every user+system prompt seen so far, flattened to one string per call.
    pub fn recorded_prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[async_trait]
impl LanguageProvider for MockProvider {
    fn provider_id(&self) -> &str {
        "mock"
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        _opts: &CompletionOptions,
    ) -> Result<CompletionOutput, EngineError> {
        let prompt = messages
            .iter()
            .map(|m| format!("[{}] {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        self.prompts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(prompt);

        let next = self
            .replies
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        match next {
            Some(Ok(text)) => Ok(CompletionOutput { text, usage: None }),
            Some(Err(e)) => Err(e),
            None => Err(EngineError::LlmUnavailable(
                "mock provider has no scripted reply left".to_string(),
            )),
        }
    }
}
