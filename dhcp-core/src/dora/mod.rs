//! Protocol state machines: dispatch by message type, drive the allocator
//! inside a store transaction, build the reply, pick the send path.
//!
//! The per-family engines ([`DoraV4`], [`DoraV6`]) are pure protocol
//! logic returning reply messages; [`DhcpService`] is the
//! [`MessageHandler`] glueing them to the transport.
use std::sync::Arc;

use async_trait::async_trait;

pub mod options;
pub mod v4;
pub mod v6;

pub use v4::DoraV4;
pub use v6::DoraV6;

use crate::{
    handler::MessageHandler,
    server::{
        msg::{Message, Packet},
        Transport,
    },
    Error,
};

/// The handler the supervisor dispatches every ingress message to
#[derive(Debug)]
pub struct DhcpService {
    v4: DoraV4,
    v6: DoraV6,
    transport: Arc<Transport>,
}

impl DhcpService {
    pub fn new(v4: DoraV4, v6: DoraV6, transport: Arc<Transport>) -> Self {
        Self { v4, v6, transport }
    }
}

#[async_trait]
impl MessageHandler for DhcpService {
    async fn handle(&self, msg: Message) -> Result<(), Error> {
        match &msg.pkt {
            Packet::V4(_) => {
                let server_ip = self.transport.server_ipv4(msg.iface_idx)?;
                if let Some(reply) = self.v4.respond(&msg, server_ip).await? {
                    v4::send_reply(&self.transport, &msg, &reply).await?;
                }
            }
            Packet::V6(_) => {
                if let Some(reply) = self.v6.respond(&msg).await? {
                    v6::send_reply(&self.transport, &msg, &reply).await?;
                }
            }
        }
        Ok(())
    }
}
