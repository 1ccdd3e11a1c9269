//! Routes chain messages to the action registered for their type.

use dashmap::DashMap;
use std::sync::Arc;

use crate::action::Action;

/// Maps message-type tags to actions.
///
/// An explicit dependency of the message handler — there is no ambient
/// registry. Actions insert themselves at construction; the last
/// registration for a tag wins; entries live for the life of the process.
#[derive(Default)]
pub struct ChainDispatcher {
    actions: DashMap<String, Arc<dyn Action>>,
}

impl ChainDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action for a message type. Replaces any previous
    /// registration for the same tag.
    pub fn register(&self, message_type: impl Into<String>, action: Arc<dyn Action>) {
        let message_type = message_type.into();
        tracing::debug!(message_type = %message_type, "action registered");
        self.actions.insert(message_type, action);
    }

    /// Look up the action for a message type. `None` for unregistered
    /// types — the handler turns that into an error reply, never a crash.
    pub fn lookup(&self, message_type: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(message_type).map(|e| e.value().clone())
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.actions.iter().map(|e| e.key().clone()).collect()
    }
}
