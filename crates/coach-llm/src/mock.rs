use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use coach_core::errors::ModelError;
use coach_core::messages::ChatMessage;
use coach_core::provider::ChatModel;

/// Scripted replies for deterministic tests without a real model.
#[derive(Clone, Debug)]
pub enum MockReply {
    Text(String),
    Error(ModelError),
    /// Wait, then resolve the inner reply.
    Delay(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn text(text: &str) -> Self {
        Self::Text(text.to_string())
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Model that returns its scripted replies in order and remembers what it was asked.
pub struct MockModel {
    replies: Vec<MockReply>,
    call_count: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl MockModel {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies,
            call_count: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().last().cloned()
    }
}

#[async_trait]
impl ChatModel for MockModel {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, prompt: &str, _history: &[ChatMessage]) -> Result<String, ModelError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.prompts.lock().push(prompt.to_string());

        let Some(mut current) = self.replies.get(idx) else {
            return Err(ModelError::InvalidRequest(format!(
                "MockModel: no reply configured for call {idx}"
            )));
        };
        loop {
            match current {
                MockReply::Text(text) => return Ok(text.clone()),
                MockReply::Error(e) => return Err(e.clone()),
                MockReply::Delay(duration, inner) => {
                    tokio::time::sleep(*duration).await;
                    current = inner;
                }
            }
        }
    }
}
