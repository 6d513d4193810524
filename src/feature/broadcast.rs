//! Relay of inbound messages to every port, with echo suppression.
//!
//! On receive at endpoint scope the message is tagged with the endpoint id.
//! On receive at router scope it is sent back out through the router. On
//! send at endpoint scope a message tagged with the destination endpoint's
//! own id is dropped, so the peer that produced a message never gets it
//! back. The origin tag is the only loop guard; there is no hop limit.

use async_trait::async_trait;
use log::warn;

use super::{Feature, FeatureAction, FeatureContext};
use crate::{
    connection::{Connection, ConnectionKind},
    message::MessageRef,
};

/// Identifier of [`BroadcastFeature`].
pub const BROADCAST_FEATURE_ID: &str = "broadcast";

/// Hub-style relay feature.
#[derive(Clone, Copy, Debug, Default)]
pub struct BroadcastFeature {
    priority: i32,
}

impl BroadcastFeature {
    /// Create the feature with priority 0.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Create the feature with a custom priority.
    #[must_use]
    pub fn with_priority(priority: i32) -> Self { Self { priority } }
}

#[async_trait]
impl Feature for BroadcastFeature {
    fn id(&self) -> &str { BROADCAST_FEATURE_ID }

    fn name(&self) -> &str { "Broadcast" }

    fn priority(&self) -> i32 { self.priority }

    async fn process_rx(&self, message: &MessageRef, ctx: &FeatureContext<'_>) -> FeatureAction {
        match (ctx.scope, ctx.router) {
            (ConnectionKind::Endpoint, _) => {
                message.tags().set_origin(ctx.connection_id);
            }
            (ConnectionKind::Router, Some(router)) => {
                if let Err(e) = router.send(MessageRef::clone(message), ctx.cancel).await {
                    warn!(
                        "broadcast relay failed: router={}, message={}, error={e}",
                        router.id(),
                        message.name()
                    );
                }
            }
            _ => {}
        }
        FeatureAction::Continue
    }

    async fn process_tx(&self, message: &MessageRef, ctx: &FeatureContext<'_>) -> FeatureAction {
        if ctx.scope == ConnectionKind::Endpoint && message.tags().is_origin(ctx.connection_id) {
            return FeatureAction::Drop;
        }
        FeatureAction::Continue
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::protocol::example::ExampleMessage1;

    #[tokio::test]
    async fn endpoint_rx_tags_and_tx_suppresses_echo() {
        let feature = BroadcastFeature::new();
        let cancel = CancellationToken::new();
        let message: MessageRef = Arc::new(ExampleMessage1::new(4));

        let origin = FeatureContext::new(ConnectionKind::Endpoint, "port-a/peer", &cancel);
        assert!(matches!(feature.process_rx(&message, &origin).await, FeatureAction::Continue));
        assert!(message.tags().is_origin("port-a/peer"));

        assert!(matches!(feature.process_tx(&message, &origin).await, FeatureAction::Drop));
        let other = FeatureContext::new(ConnectionKind::Endpoint, "port-b/peer", &cancel);
        assert!(matches!(feature.process_tx(&message, &other).await, FeatureAction::Continue));
    }

    #[tokio::test]
    async fn port_scope_is_transparent() {
        let feature = BroadcastFeature::new();
        let cancel = CancellationToken::new();
        let message: MessageRef = Arc::new(ExampleMessage1::new(4));
        let port = FeatureContext::new(ConnectionKind::Port, "port-a", &cancel);
        message.tags().set_origin("port-a");
        assert!(matches!(feature.process_rx(&message, &port).await, FeatureAction::Continue));
        assert!(matches!(feature.process_tx(&message, &port).await, FeatureAction::Continue));
    }
}
