//! Transport that replays prepared host answers

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use vouch_core::{
    ExchangeRequest, ExchangeResponse, ResponseAudit, StateQuery, StateReply, Transport,
    TransportError,
};

/// Answers exchanges and state queries from scripts, recording every request.
/// An exhausted script answers `Unreachable`.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    exchanges: Arc<Mutex<VecDeque<Result<ExchangeResponse, TransportError>>>>,
    states: Arc<Mutex<VecDeque<Result<StateReply, TransportError>>>>,
    requests: Arc<Mutex<Vec<ExchangeRequest>>>,
    queries: Arc<Mutex<Vec<StateQuery>>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_exchange(&self, response: Result<ExchangeResponse, TransportError>) {
        self.exchanges.lock().push_back(response);
    }

    /// Exchange answer with no replies and the given audit
    pub fn push_audit(&self, audit: ResponseAudit) {
        self.push_exchange(Ok(ExchangeResponse {
            replies: Vec::new(),
            audit: Some(audit),
        }));
    }

    pub fn push_state(&self, reply: Result<StateReply, TransportError>) {
        self.states.lock().push_back(reply);
    }

    pub fn requests(&self) -> Vec<ExchangeRequest> {
        self.requests.lock().clone()
    }

    pub fn queries(&self) -> Vec<StateQuery> {
        self.queries.lock().clone()
    }
}

fn exhausted() -> TransportError {
    TransportError::Unreachable {
        reason: "script exhausted".to_string(),
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn exchange(
        &self,
        request: ExchangeRequest,
    ) -> Result<ExchangeResponse, TransportError> {
        self.requests.lock().push(request);
        self.exchanges.lock().pop_front().unwrap_or_else(|| Err(exhausted()))
    }

    async fn query_state(&self, query: StateQuery) -> Result<StateReply, TransportError> {
        self.queries.lock().push(query);
        self.states.lock().pop_front().unwrap_or_else(|| Err(exhausted()))
    }
}
