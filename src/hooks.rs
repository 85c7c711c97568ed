//! Session hooks: callbacks observing and shaping the append, read and
//! commit paths of an event stream.
//!
//! Hooks are registered as one tagged variant per family and dispatched in
//! registration order. The per-family lists are kept partitioned so
//! dispatch never rescans the full registration list.

use std::sync::Arc;

use crate::document::{ObjectDocument, StreamChunk};
use crate::event::{ActionMetadata, Event};
use crate::version::Version;

/// Draft header of an event under construction, handed to pre-append hooks
/// together with the mutable payload.
#[derive(Debug, Clone)]
pub struct EventDraft {
    /// Logical event name resolved through the type registry.
    pub event_type: String,

    /// Schema version of the payload being appended.
    pub schema_version: u32,

    /// Tentative position the event will take in the stream.
    pub event_version: Version,

    /// Causal context passed by the caller, if any.
    pub action_metadata: Option<ActionMetadata>,
}

/// Transforms the payload of an event about to be buffered. Runs before
/// the payload is attached to the event, in registration order; each hook
/// sees the output of the previous one.
pub type PreAppendHook =
    Arc<dyn Fn(&mut serde_json::Value, &EventDraft, &ObjectDocument) + Send + Sync>;

/// Observes the events of a successfully committed batch.
pub type PostCommitHook = Arc<dyn Fn(&[Event], &ObjectDocument) + Send + Sync>;

/// Reshapes the event list produced by a stream read, after upcasting.
pub type PostReadHook = Arc<dyn Fn(&mut Vec<Event>, &ObjectDocument) + Send + Sync>;

/// Notified exactly once when a chunk fills up and closes.
pub type ChunkClosedHook = Arc<dyn Fn(&StreamChunk, &ObjectDocument) + Send + Sync>;

/// A hook registration, tagged by the family it belongs to.
#[derive(Clone)]
pub enum SessionHook {
    /// Payload transform on the append path.
    PreAppend(PreAppendHook),
    /// Observer of committed batches.
    PostCommit(PostCommitHook),
    /// Transform of read results.
    PostRead(PostReadHook),
    /// Observer of chunk closures.
    ChunkClosed(ChunkClosedHook),
}

/// The hook registrations of one event stream, partitioned per family.
#[derive(Clone, Default)]
pub struct HookSet {
    pre_append: Vec<PreAppendHook>,
    post_commit: Vec<PostCommitHook>,
    post_read: Vec<PostReadHook>,
    chunk_closed: Vec<ChunkClosedHook>,
}

impl HookSet {
    /// Creates an empty hook set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a hook; dispatch within its family follows registration
    /// order.
    pub fn register(&mut self, hook: SessionHook) {
        match hook {
            SessionHook::PreAppend(hook) => self.pre_append.push(hook),
            SessionHook::PostCommit(hook) => self.post_commit.push(hook),
            SessionHook::PostRead(hook) => self.post_read.push(hook),
            SessionHook::ChunkClosed(hook) => self.chunk_closed.push(hook),
        }
    }

    /// Registers a pre-append payload transform.
    pub fn on_pre_append<F>(&mut self, hook: F)
    where
        F: Fn(&mut serde_json::Value, &EventDraft, &ObjectDocument) + Send + Sync + 'static,
    {
        self.register(SessionHook::PreAppend(Arc::new(hook)));
    }

    /// Registers a post-commit observer.
    pub fn on_post_commit<F>(&mut self, hook: F)
    where
        F: Fn(&[Event], &ObjectDocument) + Send + Sync + 'static,
    {
        self.register(SessionHook::PostCommit(Arc::new(hook)));
    }

    /// Registers a post-read transform.
    pub fn on_post_read<F>(&mut self, hook: F)
    where
        F: Fn(&mut Vec<Event>, &ObjectDocument) + Send + Sync + 'static,
    {
        self.register(SessionHook::PostRead(Arc::new(hook)));
    }

    /// Registers a chunk-closed observer.
    pub fn on_chunk_closed<F>(&mut self, hook: F)
    where
        F: Fn(&StreamChunk, &ObjectDocument) + Send + Sync + 'static,
    {
        self.register(SessionHook::ChunkClosed(Arc::new(hook)));
    }

    pub(crate) fn run_pre_append(
        &self,
        payload: &mut serde_json::Value,
        draft: &EventDraft,
        document: &ObjectDocument,
    ) {
        for hook in &self.pre_append {
            hook(payload, draft, document);
        }
    }

    pub(crate) fn run_post_commit(&self, events: &[Event], document: &ObjectDocument) {
        for hook in &self.post_commit {
            hook(events, document);
        }
    }

    pub(crate) fn run_post_read(&self, events: &mut Vec<Event>, document: &ObjectDocument) {
        for hook in &self.post_read {
            hook(events, document);
        }
    }

    pub(crate) fn run_chunk_closed(&self, chunk: &StreamChunk, document: &ObjectDocument) {
        for hook in &self.chunk_closed {
            hook(chunk, document);
        }
    }
}

impl std::fmt::Debug for HookSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookSet")
            .field("pre_append", &self.pre_append.len())
            .field("post_commit", &self.post_commit.len())
            .field("post_read", &self.post_read.len())
            .field("chunk_closed", &self.chunk_closed.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use super::*;
    use crate::document::StreamInformation;

    fn document() -> ObjectDocument {
        ObjectDocument::new(
            "order",
            "order-1",
            StreamInformation::new("stream-1", "memory", "data", "documents"),
        )
    }

    #[test]
    fn pre_append_hooks_run_in_registration_order() {
        let mut hooks = HookSet::new();
        hooks.on_pre_append(|payload, _, _| {
            payload["trail"] = json!("first");
        });
        hooks.on_pre_append(|payload, _, _| {
            let prior = payload["trail"].as_str().unwrap_or_default().to_owned();
            payload["trail"] = json!(format!("{prior},second"));
        });

        let draft = EventDraft {
            event_type: "OrderWasPlaced".to_owned(),
            schema_version: 1,
            event_version: 0,
            action_metadata: None,
        };

        let mut payload = json!({});
        hooks.run_pre_append(&mut payload, &draft, &document());

        assert_eq!(json!("first,second"), payload["trail"]);
    }

    #[test]
    fn families_dispatch_independently() {
        static CLOSED: AtomicU32 = AtomicU32::new(0);

        let mut hooks = HookSet::new();
        hooks.on_chunk_closed(|_, _| {
            CLOSED.fetch_add(1, Ordering::SeqCst);
        });

        let chunk = StreamChunk {
            chunk_identifier: 0,
            first_event_version: 0,
            last_event_version: 9,
        };

        hooks.run_chunk_closed(&chunk, &document());
        hooks.run_post_commit(&[], &document());

        assert_eq!(1, CLOSED.load(Ordering::SeqCst));
    }
}
