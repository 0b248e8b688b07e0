//! Delivery of commands to a ready worker process.
//!
//! The supervisor hands commands to one forwarder task per node, which calls
//! [`WorkerTransport::deliver`] one command at a time in arrival order. The
//! returned value is routed back to the requester by [`CommandId`].

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use fleet_id::CommandId;
use serde_json::Value;
use tracing::debug;

use crate::error::TransportError;
use crate::provider::ResourceHandle;

/// Channel to the worker running on a provisioned resource.
#[async_trait]
pub trait WorkerTransport: Send + Sync + 'static {
    /// Deliver one command and wait for the worker's response.
    async fn deliver(
        &self,
        handle: &ResourceHandle,
        id: CommandId,
        payload: Value,
    ) -> Result<Value, TransportError>;
}

/// Mock transport that echoes payloads and records delivery order.
pub struct MockTransport {
    delivered: Mutex<Vec<CommandId>>,
    latency: Duration,
    fail_with: Option<TransportError>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            delivered: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
            fail_with: None,
        }
    }

    /// Reject every delivery with this message.
    pub fn rejecting(message: impl Into<String>) -> Self {
        Self {
            fail_with: Some(TransportError::Rejected(message.into())),
            ..Self::new()
        }
    }

    /// Fail every delivery as if the worker could not be reached.
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self {
            fail_with: Some(TransportError::Unreachable(message.into())),
            ..Self::new()
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// IDs in the order they reached the worker.
    pub fn delivered(&self) -> Vec<CommandId> {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerTransport for MockTransport {
    async fn deliver(
        &self,
        handle: &ResourceHandle,
        id: CommandId,
        payload: Value,
    ) -> Result<Value, TransportError> {
        debug!(
            instance_id = %handle.provider_instance_id,
            command_id = %id,
            "[MOCK] Delivering command"
        );

        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id);

        tokio::time::sleep(self.latency).await;

        match &self.fail_with {
            Some(error) => Err(error.clone()),
            None => Ok(serde_json::json!({ "id": id, "echo": payload })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn handle() -> ResourceHandle {
        ResourceHandle {
            provider_instance_id: "i-0000000000000001".to_string(),
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }

    #[tokio::test]
    async fn test_mock_transport_echoes() {
        let transport = MockTransport::new();
        let id = CommandId::new();

        let response = transport
            .deliver(&handle(), id, serde_json::json!({"op": "ping"}))
            .await
            .unwrap();

        assert_eq!(response["echo"]["op"], "ping");
        assert_eq!(transport.delivered(), vec![id]);
    }

    #[tokio::test]
    async fn test_mock_transport_rejecting() {
        let transport = MockTransport::rejecting("busy");
        let result = transport
            .deliver(&handle(), CommandId::new(), Value::Null)
            .await;

        assert_eq!(result.unwrap_err(), TransportError::Rejected("busy".to_string()));
        assert_eq!(transport.delivered().len(), 1);
    }

    #[tokio::test]
    async fn test_mock_transport_unreachable() {
        let transport = MockTransport::unreachable("connection refused");
        let result = transport
            .deliver(&handle(), CommandId::new(), Value::Null)
            .await;

        assert_eq!(
            result.unwrap_err(),
            TransportError::Unreachable("connection refused".to_string())
        );
    }
}
