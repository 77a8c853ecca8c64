//! Pending-call store: correlation id -> single-fire reply slot.
//!
//! The receive loop resolves an entry by removing it and firing its
//! `oneshot`, so a slot can fire at most once. The calling task owns a
//! [`PendingGuard`] that removes the entry on every exit path; removing an
//! already-resolved entry is a no-op.

use dashmap::DashMap;
use relay_core::{CallStatus, ContentType, CorrelationId};
use tokio::sync::oneshot;

/// Reply data handed from the receive loop to the waiting caller.
#[derive(Debug)]
pub(crate) struct Reply {
    pub(crate) status: CallStatus,
    pub(crate) content_type: ContentType,
    pub(crate) body: Vec<u8>,
}

#[derive(Debug, Default)]
pub(crate) struct PendingCalls {
    calls: DashMap<CorrelationId, oneshot::Sender<Reply>>,
}

impl PendingCalls {
    /// Registers a call and returns its removal guard and reply receiver.
    pub(crate) fn register(
        &self,
        id: CorrelationId,
    ) -> (PendingGuard<'_>, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        let previous = self.calls.insert(id.clone(), tx);
        debug_assert!(previous.is_none(), "correlation id reused while in flight");
        (PendingGuard { calls: self, id }, rx)
    }

    /// Delivers a reply to the matching call, if it is still waiting.
    ///
    /// Returns `false` when no call is registered under `id`.
    pub(crate) fn resolve(&self, id: &str, reply: Reply) -> bool {
        // Remove first; the shard lock is released before the send.
        let Some((_, tx)) = self.calls.remove(id) else {
            return false;
        };
        tx.send(reply).is_ok()
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Removes its call from the store when dropped.
#[derive(Debug)]
pub(crate) struct PendingGuard<'a> {
    calls: &'a PendingCalls,
    id: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.calls.calls.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(text: &str) -> Reply {
        Reply {
            status: CallStatus::Success,
            content_type: ContentType::Json,
            body: text.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn resolve_fires_registered_call() {
        let calls = PendingCalls::default();
        let id = CorrelationId::generate();
        let (_guard, rx) = calls.register(id.clone());
        assert_eq!(calls.len(), 1);

        assert!(calls.resolve(id.as_str(), reply("1")));
        assert_eq!(rx.await.unwrap().body, b"1");
        assert_eq!(calls.len(), 0);
    }

    #[test]
    fn resolve_without_registration_is_dropped() {
        let calls = PendingCalls::default();
        assert!(!calls.resolve("unknown", reply("x")));
    }

    #[test]
    fn second_resolve_is_dropped() {
        let calls = PendingCalls::default();
        let id = CorrelationId::generate();
        let (_guard, _rx) = calls.register(id.clone());

        assert!(calls.resolve(id.as_str(), reply("first")));
        assert!(!calls.resolve(id.as_str(), reply("second")));
    }

    #[test]
    fn guard_removes_entry_on_drop() {
        let calls = PendingCalls::default();
        let id = CorrelationId::generate();
        let (guard, _rx) = calls.register(id.clone());
        drop(guard);

        assert_eq!(calls.len(), 0);
        assert!(!calls.resolve(id.as_str(), reply("late")));
    }

    #[test]
    fn resolve_after_receiver_dropped_reports_false() {
        let calls = PendingCalls::default();
        let id = CorrelationId::generate();
        let (_guard, rx) = calls.register(id.clone());
        drop(rx);

        assert!(!calls.resolve(id.as_str(), reply("late")));
        assert_eq!(calls.len(), 0);
    }
}
