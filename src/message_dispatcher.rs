use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::net::SocketAddr;

/// The transport's upcall seam: invoked exactly once per fully reassembled
/// inbound message, with the sender's address and the message bytes.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn on_message(&self, sender_addr: SocketAddr, msg_buf: &[u8]);
}
