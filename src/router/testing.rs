//! Scriptable in-memory provider for router and server tests.

use crate::client::{ChunkStream, LlmProvider, ProviderEntry};
use crate::models::{Completion, Message, ProviderError, ProviderIdentity};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct FakeState {
    name: String,
    complete_ok: AtomicBool,
    probe_ok: AtomicBool,
    break_stream: AtomicBool,
    complete_delay: Mutex<Duration>,
    probe_delay: Mutex<Duration>,
    complete_calls: AtomicUsize,
    probe_calls: AtomicUsize,
    stream_calls: AtomicUsize,
    last_messages: Mutex<Vec<Message>>,
}

/// Provider whose outcomes are toggled by the test.
#[derive(Clone)]
pub struct FakeProvider {
    state: Arc<FakeState>,
}

impl FakeProvider {
    pub fn new(name: &str) -> Self {
        Self {
            state: Arc::new(FakeState {
                name: name.to_string(),
                complete_ok: AtomicBool::new(true),
                probe_ok: AtomicBool::new(true),
                break_stream: AtomicBool::new(false),
                complete_delay: Mutex::new(Duration::ZERO),
                probe_delay: Mutex::new(Duration::ZERO),
                complete_calls: AtomicUsize::new(0),
                probe_calls: AtomicUsize::new(0),
                stream_calls: AtomicUsize::new(0),
                last_messages: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn set_complete_ok(&self, ok: bool) {
        self.state.complete_ok.store(ok, Ordering::SeqCst);
    }

    pub fn set_probe_ok(&self, ok: bool) {
        self.state.probe_ok.store(ok, Ordering::SeqCst);
    }

    /// Make streams fail after their first chunk.
    pub fn set_break_stream(&self, broken: bool) {
        self.state.break_stream.store(broken, Ordering::SeqCst);
    }

    pub fn set_complete_delay(&self, delay: Duration) {
        *self.state.complete_delay.lock().unwrap() = delay;
    }

    pub fn set_probe_delay(&self, delay: Duration) {
        *self.state.probe_delay.lock().unwrap() = delay;
    }

    pub fn complete_calls(&self) -> usize {
        self.state.complete_calls.load(Ordering::SeqCst)
    }

    pub fn probe_calls(&self) -> usize {
        self.state.probe_calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> usize {
        self.state.stream_calls.load(Ordering::SeqCst)
    }

    pub fn last_messages(&self) -> Vec<Message> {
        self.state.last_messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for FakeProvider {
    fn name(&self) -> &str {
        &self.state.name
    }

    fn model(&self) -> &str {
        "fake-model"
    }

    async fn complete(&self, messages: &[Message]) -> Result<Completion, ProviderError> {
        self.state.complete_calls.fetch_add(1, Ordering::SeqCst);
        *self.state.last_messages.lock().unwrap() = messages.to_vec();

        // outcome is fixed when the call starts
        let ok = self.state.complete_ok.load(Ordering::SeqCst);
        let delay = *self.state.complete_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if ok {
            Ok(Completion {
                content: format!("answer from {}", self.state.name),
                model: "fake-model".to_string(),
                input_tokens: 1,
                output_tokens: 1,
                duration: delay,
            })
        } else {
            Err(ProviderError::Api {
                status: 503,
                message: format!("{} is down", self.state.name),
            })
        }
    }

    /// Streams "answer from <name>" in three chunks.
    async fn stream(&self, messages: &[Message]) -> Result<ChunkStream, ProviderError> {
        self.state.stream_calls.fetch_add(1, Ordering::SeqCst);
        *self.state.last_messages.lock().unwrap() = messages.to_vec();

        let ok = self.state.complete_ok.load(Ordering::SeqCst);
        let broken = self.state.break_stream.load(Ordering::SeqCst);
        let delay = *self.state.complete_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if !ok {
            return Err(ProviderError::Api {
                status: 503,
                message: format!("{} is down", self.state.name),
            });
        }

        let chunks = if broken {
            vec![
                Ok("answer ".to_string()),
                Err(ProviderError::InvalidResponse("stream cut".to_string())),
            ]
        } else {
            vec![
                Ok("answer ".to_string()),
                Ok("from ".to_string()),
                Ok(self.state.name.clone()),
            ]
        };
        Ok(stream::iter(chunks).boxed())
    }

    async fn probe(&self) -> Result<(), ProviderError> {
        self.state.probe_calls.fetch_add(1, Ordering::SeqCst);

        let ok = self.state.probe_ok.load(Ordering::SeqCst);
        let delay = *self.state.probe_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if ok {
            Ok(())
        } else {
            Err(ProviderError::Api {
                status: 503,
                message: "probe failed".to_string(),
            })
        }
    }
}

pub fn identity(name: &str, priority: u32) -> ProviderIdentity {
    ProviderIdentity {
        name: name.to_string(),
        priority,
        model: "fake-model".to_string(),
    }
}

/// Registry entry for a fake provider with a one-second dispatch timeout.
pub fn entry(priority: u32, provider: &FakeProvider) -> ProviderEntry {
    ProviderEntry::new(
        identity(provider.name(), priority),
        Arc::new(provider.clone()),
        Duration::from_secs(1),
    )
}
