//! Handler seam between the ingress pipeline and the protocol logic
use async_trait::async_trait;

use crate::{server::msg::Message, Error};

/// A consumer of ingress [`Message`]s. The supervisor dispatches every
/// received message to one of these on a fresh task holding an in-flight
/// permit.
///
/// Returning an error drops the message: DHCP is best-effort and the
/// client will retry. Replies are sent by the handler itself through the
/// transport it was built with.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Process one message to completion, including any reply
    async fn handle(&self, msg: Message) -> Result<(), Error>;
}
