use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use marquee_core::errors::ServiceError;
use marquee_core::provider::{LanguageModel, PromptMessage};

/// Pre-programmed reply for deterministic tests without API calls.
#[derive(Clone, Debug)]
pub enum MockReply {
    Text(String),
    Error(ServiceError),
    /// Wait a duration, then yield the inner reply.
    Delay(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn json(value: serde_json::Value) -> Self {
        Self::Text(value.to_string())
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

struct Route {
    marker: String,
    replies: VecDeque<MockReply>,
}

/// Language model that answers from scripted queues.
///
/// A prompt containing a route's marker (in any message) consumes that
/// route's queue; everything else consumes the default queue in order.
pub struct MockModel {
    default: Mutex<VecDeque<MockReply>>,
    routes: Mutex<Vec<Route>>,
    calls: Mutex<Vec<Vec<PromptMessage>>>,
    call_count: AtomicUsize,
}

impl MockModel {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            default: Mutex::new(replies.into()),
            routes: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    /// A model with nothing scripted: every call fails.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn route(self, marker: impl Into<String>, replies: Vec<MockReply>) -> Self {
        self.routes.lock().push(Route {
            marker: marker.into(),
            replies: replies.into(),
        });
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn calls(&self) -> Vec<Vec<PromptMessage>> {
        self.calls.lock().clone()
    }

    /// Number of calls whose prompt contained `marker`.
    pub fn calls_matching(&self, marker: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|prompt| prompt.iter().any(|m| m.content.contains(marker)))
            .count()
    }

    fn next_reply(&self, prompt: &[PromptMessage]) -> Option<MockReply> {
        let mut routes = self.routes.lock();
        if let Some(route) = routes
            .iter_mut()
            .find(|r| prompt.iter().any(|m| m.content.contains(&r.marker)))
        {
            return route.replies.pop_front();
        }
        drop(routes);
        self.default.lock().pop_front()
    }
}

#[async_trait]
impl LanguageModel for MockModel {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn invoke(&self, prompt: &[PromptMessage]) -> Result<String, ServiceError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.calls.lock().push(prompt.to_vec());

        let Some(mut reply) = self.next_reply(prompt) else {
            return Err(ServiceError::InvalidResponse(format!(
                "MockModel: no reply configured for call {idx}"
            )));
        };

        loop {
            match reply {
                MockReply::Text(text) => return Ok(text),
                MockReply::Error(e) => return Err(e),
                MockReply::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    reply = *inner;
                }
            }
        }
    }
}
