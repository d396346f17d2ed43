//! Per-message state carried through a session and into the spool.
//!
//! A [`Context`] is created when a transaction starts (`MAIL FROM`) and is
//! handed to collaborators (DNS, policy, auth, queue) and to the spool's
//! `BackingStore` once the message has been fully received.

use std::sync::Arc;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;

/// State accumulated for a single SMTP transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Context {
    /// Identifier assigned to this transaction, distinct from the spool id
    /// assigned when the message is written to a backing store.
    pub id: String,

    /// Sender, recipients, and MAIL FROM parameters.
    pub envelope: Envelope,

    /// Raw message body, present once DATA has completed.
    #[serde(skip)]
    pub data: Option<Arc<[u8]>>,

    /// Whether this session is using an ESMTP extension that changes body
    /// encoding expectations (e.g. 8BITMIME).
    pub extended: bool,

    /// Free-form annotations attached by collaborators (DNS results, policy
    /// verdicts, auth identity, etc).
    pub metadata: AHashMap<String, String>,

    /// Identifier assigned once this context has been written to a spool.
    pub tracking_id: Option<String>,
}

impl Context {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Clears transaction-scoped state while keeping the session-scoped
    /// identity intact, mirroring the effect of an SMTP `RSET`.
    pub fn reset(&mut self) {
        self.envelope = Envelope::default();
        self.data = None;
        self.metadata.clear();
        self.tracking_id = None;
    }

    #[must_use]
    pub fn data(&self) -> Option<&Arc<[u8]>> {
        self.data.as_ref()
    }

    pub fn set_data(&mut self, data: impl Into<Arc<[u8]>>) {
        self.data = Some(data.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_transaction_state_only() {
        let mut ctx = Context::new("session-1");
        ctx.set_data(b"hello".to_vec());
        ctx.metadata.insert("dns".to_string(), "ok".to_string());
        ctx.tracking_id = Some("01ARZ".to_string());

        ctx.reset();

        assert_eq!(ctx.id, "session-1");
        assert!(ctx.data.is_none());
        assert!(ctx.metadata.is_empty());
        assert!(ctx.tracking_id.is_none());
    }

    #[test]
    fn default_context_has_no_data() {
        let ctx = Context::default();
        assert!(ctx.data().is_none());
        assert!(!ctx.extended);
    }
}
