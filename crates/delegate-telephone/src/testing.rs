//! Scripted SDK doubles for tests.
//!
//! `MockConnector` hands out clients that replay pre-loaded message
//! sequences, one per `query` call, and record every prompt and
//! connection option for assertions. Used by this crate's tests and by
//! the turn-runtime and daemon test suites.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use delegate_core::error::{DelegateError, Result};

use crate::sdk::{
    ContentBlock, PermissionGuard, SdkClient, SdkConnector, SdkMessage, SdkOptions, SdkUsage,
};

/// A scripted assistant text message.
pub fn script_text(text: &str) -> SdkMessage {
    SdkMessage::Assistant {
        content: vec![ContentBlock::Text {
            text: text.to_string(),
        }],
        model: None,
    }
}

/// A scripted assistant tool invocation.
pub fn script_tool(name: &str, input: serde_json::Value) -> SdkMessage {
    SdkMessage::Assistant {
        content: vec![ContentBlock::ToolUse {
            name: name.to_string(),
            input,
        }],
        model: None,
    }
}

/// A scripted terminal result message. `cost` is the subprocess's
/// cumulative cost at that point.
pub fn script_result(input_tokens: u64, output_tokens: u64, cost: f64) -> SdkMessage {
    SdkMessage::Result {
        total_cost_usd: cost,
        usage: SdkUsage {
            input_tokens,
            output_tokens,
            cache_read_input_tokens: 0,
            cache_creation_input_tokens: 0,
        },
    }
}

/// Shared state between the connector and its clients.
#[derive(Default)]
struct MockState {
    turns: Mutex<VecDeque<Vec<SdkMessage>>>,
    prompts: Mutex<Vec<String>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    last_options: Mutex<Option<SdkOptions>>,
    last_guard: Mutex<Option<PermissionGuard>>,
    fail_query: AtomicBool,
}

/// Connector replaying scripted turns.
#[derive(Default)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue the message sequence returned by the next `query` call.
    pub fn push_turn(&self, messages: Vec<SdkMessage>) {
        self.state.turns.lock().unwrap().push_back(messages);
    }

    /// Every prompt any client received, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.state.prompts.lock().unwrap().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.state.disconnects.load(Ordering::SeqCst)
    }

    pub fn last_options(&self) -> Option<SdkOptions> {
        self.state.last_options.lock().unwrap().clone()
    }

    pub fn last_had_guard(&self) -> bool {
        self.state.last_guard.lock().unwrap().is_some()
    }

    /// Invoke the guard handed to the last connect, if any.
    pub fn last_guard(&self) -> Option<PermissionGuard> {
        self.state.last_guard.lock().unwrap().clone()
    }

    /// Make every subsequent `query` fail with an SDK error.
    pub fn fail_queries(&self) {
        self.state.fail_query.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SdkConnector for MockConnector {
    async fn connect(
        &self,
        options: SdkOptions,
        guard: Option<PermissionGuard>,
    ) -> Result<Box<dyn SdkClient>> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        *self.state.last_options.lock().unwrap() = Some(options);
        *self.state.last_guard.lock().unwrap() = guard;
        Ok(Box::new(MockClient {
            state: self.state.clone(),
            pending: VecDeque::new(),
        }))
    }
}

struct MockClient {
    state: Arc<MockState>,
    pending: VecDeque<SdkMessage>,
}

#[async_trait]
impl SdkClient for MockClient {
    async fn query(&mut self, prompt: &str) -> Result<()> {
        if self.state.fail_query.load(Ordering::SeqCst) {
            return Err(DelegateError::Sdk("subprocess crashed".into()));
        }
        self.state.prompts.lock().unwrap().push(prompt.to_string());
        let scripted = self
            .state
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        self.pending = scripted.into();
        Ok(())
    }

    async fn next_message(&mut self) -> Result<Option<SdkMessage>> {
        Ok(self.pending.pop_front())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
