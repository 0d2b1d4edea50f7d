//! RecordingTransport - an in-process fake provider.
//!
//! Replays a scripted sequence of responses and records every message it is
//! asked to send. Used by tests and by local runs that should never reach
//! the network.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::ports::{DeliveryContext, DeliveryTransport, OutboundMessage, TransportError};

pub struct RecordingTransport {
    script: Mutex<VecDeque<Result<u16, TransportError>>>,
    /// Returned once the script is exhausted.
    fallback: Result<u16, TransportError>,
    calls: Mutex<Vec<OutboundMessage>>,
    latency: Duration,
}

impl RecordingTransport {
    /// Accepts everything with status 200.
    pub fn new() -> Self {
        Self::always(Ok(200))
    }

    pub fn always(response: Result<u16, TransportError>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: response,
            calls: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
        }
    }

    /// Play `responses` in order, then fall back to 200.
    pub fn scripted(responses: impl IntoIterator<Item = Result<u16, TransportError>>) -> Self {
        Self {
            script: Mutex::new(responses.into_iter().collect()),
            ..Self::new()
        }
    }

    /// Simulated round-trip time per call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub async fn calls(&self) -> Vec<OutboundMessage> {
        self.calls.lock().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliveryTransport for RecordingTransport {
    async fn send(
        &self,
        message: &OutboundMessage,
        _ctx: &DeliveryContext,
    ) -> Result<u16, TransportError> {
        self.calls.lock().await.push(message.clone());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let next = self.script.lock().await.pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}
