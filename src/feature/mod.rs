//! Message interceptors applied on every receive and send.
//!
//! A [`Feature`] sees each message once per scope it passes through. Features
//! run in ascending [`Feature::priority`] order; equal priorities keep their
//! registration order. Any feature may replace the message or drop it, and a
//! drop skips the remaining features and suppresses delivery.

pub mod broadcast;
pub mod filter;

use std::{fmt, sync::Arc};

use arc_swap::ArcSwap;
use async_trait::async_trait;
pub use broadcast::BroadcastFeature;
pub use filter::{MessagePredicate, PredicateFilter};
use tokio_util::sync::CancellationToken;

use crate::{connection::ConnectionKind, message::MessageRef, router::Router};

/// Verdict of a feature on one message.
#[derive(Clone, Debug)]
pub enum FeatureAction {
    /// Pass the message on unchanged.
    Continue,
    /// Pass a different message on.
    Replace(MessageRef),
    /// Stop processing and do not deliver.
    Drop,
}

/// Where a pipeline is running.
#[derive(Clone, Copy)]
pub struct FeatureContext<'a> {
    /// Kind of connection running the pipeline.
    pub scope: ConnectionKind,
    /// Identifier of that connection.
    pub connection_id: &'a str,
    /// The router, when `scope` is [`ConnectionKind::Router`].
    pub router: Option<&'a Router>,
    /// Token to pass to any send a feature performs.
    pub cancel: &'a CancellationToken,
}

impl<'a> FeatureContext<'a> {
    /// Context for an endpoint or port.
    #[must_use]
    pub fn new(scope: ConnectionKind, connection_id: &'a str, cancel: &'a CancellationToken) -> Self {
        Self {
            scope,
            connection_id,
            router: None,
            cancel,
        }
    }

    /// Context for `router`.
    #[must_use]
    pub fn for_router(router: &'a Router, cancel: &'a CancellationToken) -> Self {
        Self {
            scope: ConnectionKind::Router,
            connection_id: crate::connection::Connection::id(router),
            router: Some(router),
            cancel,
        }
    }
}

impl fmt::Debug for FeatureContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureContext")
            .field("scope", &self.scope)
            .field("connection_id", &self.connection_id)
            .field("has_router", &self.router.is_some())
            .finish_non_exhaustive()
    }
}

/// Pluggable receive and send interceptor.
#[async_trait]
pub trait Feature: Send + Sync + fmt::Debug {
    /// Identifier used to unregister the feature.
    fn id(&self) -> &str;

    /// Human readable name.
    fn name(&self) -> &str;

    /// Position in the pipeline; lower runs first.
    fn priority(&self) -> i32 { 0 }

    /// Inspect an inbound message.
    async fn process_rx(&self, message: &MessageRef, ctx: &FeatureContext<'_>) -> FeatureAction {
        let _ = (message, ctx);
        FeatureAction::Continue
    }

    /// Inspect an outbound message.
    async fn process_tx(&self, message: &MessageRef, ctx: &FeatureContext<'_>) -> FeatureAction {
        let _ = (message, ctx);
        FeatureAction::Continue
    }
}

type FeatureList = Vec<Arc<dyn Feature>>;

/// Ordered, concurrently mutable set of features.
///
/// Readers load one snapshot per message, so a feature added while a message
/// is in flight only applies to later messages.
pub struct FeaturePipeline {
    features: ArcSwap<FeatureList>,
}

impl Default for FeaturePipeline {
    fn default() -> Self { Self::new() }
}

impl FeaturePipeline {
    /// Create an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self {
            features: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Create a pipeline holding `features`.
    #[must_use]
    pub fn from_features(features: impl IntoIterator<Item = Arc<dyn Feature>>) -> Self {
        let pipeline = Self::new();
        for feature in features {
            pipeline.add(feature);
        }
        pipeline
    }

    /// Insert `feature` after every feature of lower or equal priority.
    pub fn add(&self, feature: Arc<dyn Feature>) {
        self.features.rcu(|current| {
            let mut next = FeatureList::clone(current);
            let at = next.partition_point(|f| f.priority() <= feature.priority());
            next.insert(at, Arc::clone(&feature));
            next
        });
    }

    /// Remove every feature with `id`. Returns true if one was removed.
    pub fn remove(&self, id: &str) -> bool {
        let previous = self.features.rcu(|current| {
            current
                .iter()
                .filter(|f| f.id() != id)
                .cloned()
                .collect::<FeatureList>()
        });
        previous.iter().any(|f| f.id() == id)
    }

    /// Current features in execution order.
    #[must_use]
    pub fn snapshot(&self) -> Arc<FeatureList> { self.features.load_full() }

    /// Number of features.
    #[must_use]
    pub fn len(&self) -> usize { self.features.load().len() }

    /// Returns true if the pipeline has no features.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Run the receive side. `None` means a feature dropped the message.
    pub async fn process_rx(&self, message: MessageRef, ctx: &FeatureContext<'_>) -> Option<MessageRef> {
        let mut message = message;
        for feature in self.snapshot().iter() {
            match feature.process_rx(&message, ctx).await {
                FeatureAction::Continue => {}
                FeatureAction::Replace(next) => message = next,
                FeatureAction::Drop => {
                    tracing::trace!(feature = feature.id(), scope = %ctx.scope, id = ctx.connection_id, "rx dropped");
                    return None;
                }
            }
        }
        Some(message)
    }

    /// Run the send side. `None` means a feature dropped the message.
    pub async fn process_tx(&self, message: MessageRef, ctx: &FeatureContext<'_>) -> Option<MessageRef> {
        let mut message = message;
        for feature in self.snapshot().iter() {
            match feature.process_tx(&message, ctx).await {
                FeatureAction::Continue => {}
                FeatureAction::Replace(next) => message = next,
                FeatureAction::Drop => {
                    tracing::trace!(feature = feature.id(), scope = %ctx.scope, id = ctx.connection_id, "tx dropped");
                    return None;
                }
            }
        }
        Some(message)
    }
}

impl fmt::Debug for FeaturePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.snapshot().iter().map(|feature| (feature.id().to_owned(), feature.priority())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use rstest::rstest;

    use super::*;
    use crate::protocol::example::{ExampleMessage1, ExampleMessage2};

    #[derive(Debug)]
    struct Recorder {
        id: String,
        priority: i32,
        action: fn(&MessageRef) -> FeatureAction,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Feature for Recorder {
        fn id(&self) -> &str { &self.id }

        fn name(&self) -> &str { "recorder" }

        fn priority(&self) -> i32 { self.priority }

        async fn process_rx(&self, message: &MessageRef, _ctx: &FeatureContext<'_>) -> FeatureAction {
            self.log.lock().expect("log lock").push(self.id.clone());
            (self.action)(message)
        }
    }

    fn recorder(
        id: &str,
        priority: i32,
        action: fn(&MessageRef) -> FeatureAction,
        log: &Arc<Mutex<Vec<String>>>,
    ) -> Arc<dyn Feature> {
        Arc::new(Recorder {
            id: id.into(),
            priority,
            action,
            log: Arc::clone(log),
        })
    }

    fn pass(_: &MessageRef) -> FeatureAction { FeatureAction::Continue }

    fn drop_all(_: &MessageRef) -> FeatureAction { FeatureAction::Drop }

    fn swap(_: &MessageRef) -> FeatureAction { FeatureAction::Replace(Arc::new(ExampleMessage2::new(9, true))) }

    fn message() -> MessageRef { Arc::new(ExampleMessage1::new(1)) }

    #[tokio::test]
    async fn features_run_in_priority_then_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = FeaturePipeline::from_features([
            recorder("late", 10, pass, &log),
            recorder("first-zero", 0, pass, &log),
            recorder("early", -5, pass, &log),
            recorder("second-zero", 0, pass, &log),
        ]);
        let cancel = CancellationToken::new();
        let ctx = FeatureContext::new(ConnectionKind::Port, "p", &cancel);
        assert!(pipeline.process_rx(message(), &ctx).await.is_some());
        assert_eq!(
            *log.lock().expect("log lock"),
            ["early", "first-zero", "second-zero", "late"]
        );
    }

    #[tokio::test]
    async fn drop_short_circuits() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = FeaturePipeline::from_features([
            recorder("a", 0, drop_all, &log),
            recorder("b", 1, pass, &log),
        ]);
        let cancel = CancellationToken::new();
        let ctx = FeatureContext::new(ConnectionKind::Endpoint, "e", &cancel);
        assert!(pipeline.process_rx(message(), &ctx).await.is_none());
        assert_eq!(*log.lock().expect("log lock"), ["a"]);
    }

    #[tokio::test]
    async fn replacement_reaches_later_features_and_caller() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = FeaturePipeline::from_features([recorder("swap", 0, swap, &log)]);
        let cancel = CancellationToken::new();
        let ctx = FeatureContext::new(ConnectionKind::Endpoint, "e", &cancel);
        let out = pipeline.process_rx(message(), &ctx).await.expect("not dropped");
        assert!(out.is::<ExampleMessage2>());
    }

    #[rstest]
    #[case("a", true, 1)]
    #[case("missing", false, 2)]
    fn remove_by_id(#[case] id: &str, #[case] removed: bool, #[case] remaining: usize) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline =
            FeaturePipeline::from_features([recorder("a", 0, pass, &log), recorder("b", 0, pass, &log)]);
        assert_eq!(pipeline.remove(id), removed);
        assert_eq!(pipeline.len(), remaining);
    }
}
