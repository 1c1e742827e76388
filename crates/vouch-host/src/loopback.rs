//! In-process transport to a [`Host`], with fault injection for tests

use crate::host::Host;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;
use vouch_core::{
    ExchangeRequest, ExchangeResponse, StateQuery, StateReply, Transport, TransportError,
};

/// A failure to inject into upcoming calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The request never reaches the host
    Unreachable,
    /// The host processes the request but the response is lost
    DropResponse,
}

/// Delivers requests straight to an in-process host
#[derive(Clone)]
pub struct LoopbackTransport {
    host: Arc<Host>,
    exchange_faults: Arc<Mutex<Vec<Fault>>>,
    fail_state_queries: Arc<Mutex<usize>>,
    exchanges: Arc<AtomicUsize>,
}

impl LoopbackTransport {
    pub fn new(host: Arc<Host>) -> Self {
        Self {
            host,
            exchange_faults: Arc::new(Mutex::new(Vec::new())),
            fail_state_queries: Arc::new(Mutex::new(0)),
            exchanges: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    /// Fail the next exchange; faults are consumed in the order injected
    pub fn inject(&self, fault: Fault) {
        self.exchange_faults.lock().insert(0, fault);
    }

    pub fn fail_next_state_queries(&self, count: usize) {
        *self.fail_state_queries.lock() = count;
    }

    /// Number of exchanges that reached the host
    pub fn exchanges(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }

    fn next_fault(&self) -> Option<Fault> {
        self.exchange_faults.lock().pop()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn exchange(
        &self,
        request: ExchangeRequest,
    ) -> Result<ExchangeResponse, TransportError> {
        let fault = self.next_fault();
        if fault == Some(Fault::Unreachable) {
            debug!(role = %request.role, "Injected unreachable host");
            return Err(TransportError::Unreachable {
                reason: "injected fault".to_string(),
            });
        }

        self.exchanges.fetch_add(1, Ordering::SeqCst);
        let response = self
            .host
            .handle_exchange(request)
            .await
            .map_err(|err| TransportError::Host {
                reason: format!("{}: {err}", err.code()),
            })?;

        if fault == Some(Fault::DropResponse) {
            debug!("Injected lost response");
            return Err(TransportError::Timeout);
        }
        Ok(response)
    }

    async fn query_state(&self, query: StateQuery) -> Result<StateReply, TransportError> {
        {
            let mut remaining = self.fail_state_queries.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Unreachable {
                    reason: "injected fault".to_string(),
                });
            }
        }
        self.host
            .handle_state_query(query)
            .await
            .map_err(|err| TransportError::Host {
                reason: format!("{}: {err}", err.code()),
            })
    }
}
