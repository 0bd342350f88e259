//! Transport Ports
//!
//! Opens push connections to remote nodes.

use crate::domain::entities::Node;
use crate::domain::errors::TransportError;
use async_trait::async_trait;

#[async_trait]
pub trait TransportManager: Send + Sync {
    async fn open_push(
        &self,
        remote: &Node,
        local: &Node,
    ) -> Result<Box<dyn OutgoingTransport>, TransportError>;
}

/// One outgoing request: write the payload, then read the response lines.
#[async_trait]
pub trait OutgoingTransport: Send {
    fn write(&mut self, payload: &str) -> Result<(), TransportError>;

    /// Send what was written and return the remote response, line by line.
    async fn read_response(&mut self) -> Result<Vec<String>, TransportError>;

    /// Release the connection. Safe to call more than once.
    async fn close(&mut self);
}
