//! Predicate-driven outbound filter.

use std::{fmt, sync::Arc};

use async_trait::async_trait;

use super::{Feature, FeatureAction, FeatureContext};
use crate::{
    connection::ConnectionKind,
    message::{Message, MessageRef},
};

/// Decides whether a message may be sent.
pub type MessagePredicate = Arc<dyn Fn(&dyn Message) -> bool + Send + Sync>;

/// Drops outbound messages at one scope when the predicate returns false.
#[derive(Clone)]
pub struct PredicateFilter {
    id: String,
    scope: ConnectionKind,
    priority: i32,
    predicate: MessagePredicate,
}

impl PredicateFilter {
    /// Filter running at `scope` with priority 0.
    pub fn new(id: impl Into<String>, scope: ConnectionKind, predicate: MessagePredicate) -> Self {
        Self {
            id: id.into(),
            scope,
            priority: 0,
            predicate,
        }
    }

    /// Filter letting every message through.
    pub fn allow_all(id: impl Into<String>, scope: ConnectionKind) -> Self {
        Self::new(id, scope, Arc::new(|_: &dyn Message| true))
    }

    /// Builder-style priority override.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl fmt::Debug for PredicateFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredicateFilter")
            .field("id", &self.id)
            .field("scope", &self.scope)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Feature for PredicateFilter {
    fn id(&self) -> &str { &self.id }

    fn name(&self) -> &str { "PredicateFilter" }

    fn priority(&self) -> i32 { self.priority }

    async fn process_tx(&self, message: &MessageRef, ctx: &FeatureContext<'_>) -> FeatureAction {
        if ctx.scope == self.scope && !(self.predicate)(message.as_ref()) {
            return FeatureAction::Drop;
        }
        FeatureAction::Continue
    }
}
