use async_trait::async_trait;

use crate::errors::ModelError;
use crate::messages::ChatMessage;

/// The outbound LLM/tool call. Opaque: it may be slow, and it may fail.
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, prompt: &str, history: &[ChatMessage]) -> Result<String, ModelError>;
}
