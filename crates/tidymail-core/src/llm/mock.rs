use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{CompletionRequest, CompletionResponse, LLMClient, LLMError, LlmCallContext};

/// Replays queued responses in order and remembers every request it saw.
#[derive(Debug, Default, Clone)]
pub struct MockLLMClient {
    responses: Arc<Mutex<VecDeque<Result<CompletionResponse, LLMError>>>>,
    requests: Arc<Mutex<Vec<(CompletionRequest, LlmCallContext)>>>,
    call_count: Arc<AtomicUsize>,
}

impl MockLLMClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue plain-text answers, one per call.
    pub fn with_answers<'a>(answers: impl IntoIterator<Item = &'a str>) -> Self {
        let mock = Self::new();
        for answer in answers {
            mock.enqueue_response(Ok(CompletionResponse::text(answer)));
        }
        mock
    }

    pub fn enqueue_response(&self, response: Result<CompletionResponse, LLMError>) {
        let mut guard = self.responses.lock().expect("lock responses");
        guard.push_back(response);
    }

    /// Returns the number of times `complete` has been called.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<(CompletionRequest, LlmCallContext)> {
        self.requests.lock().expect("lock requests").clone()
    }
}

#[async_trait]
impl LLMClient for MockLLMClient {
    async fn complete(
        &self,
        request: CompletionRequest,
        context: LlmCallContext,
    ) -> Result<CompletionResponse, LLMError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .expect("lock requests")
            .push((request, context));
        let mut guard = self.responses.lock().expect("lock responses");
        guard.pop_front().unwrap_or_else(|| {
            Err(LLMError::ProviderError(
                "mock response not provided".to_string(),
            ))
        })
    }
}
