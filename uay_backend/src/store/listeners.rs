use super::{Document, Query, StoreResult};
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

#[derive(Debug, Clone)]
pub enum ListenEvent {
    /// Full current result set of the listener's query.
    Snapshot { tag: u64, documents: Vec<Document> },
    Error { tag: u64, message: String },
}

impl ListenEvent {
    pub fn tag(&self) -> u64 {
        match self {
            ListenEvent::Snapshot { tag, .. } | ListenEvent::Error { tag, .. } => *tag,
        }
    }
}

/// Where a listener delivers its snapshots. The tag is opaque to the store
/// and lets one receiver multiplex several listeners.
#[derive(Debug, Clone)]
pub struct ListenSink {
    tag: u64,
    tx: UnboundedSender<ListenEvent>,
}

impl ListenSink {
    pub fn new(tag: u64, tx: UnboundedSender<ListenEvent>) -> Self {
        Self { tag, tx }
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// Returns false once the receiving side is gone.
    pub(crate) fn deliver(&self, result: StoreResult<Vec<Document>>) -> bool {
        let event = match result {
            Ok(documents) => ListenEvent::Snapshot {
                tag: self.tag,
                documents,
            },
            Err(err) => ListenEvent::Error {
                tag: self.tag,
                message: err.to_string(),
            },
        };
        self.tx.send(event).is_ok()
    }
}

struct Listener {
    query: Query,
    sink: ListenSink,
}

#[derive(Default)]
pub(crate) struct ListenerRegistry {
    next_id: u64,
    listeners: HashMap<ListenerId, Listener>,
}

impl ListenerRegistry {
    pub(crate) fn insert(&mut self, query: Query, sink: ListenSink) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners.insert(id, Listener { query, sink });
        id
    }

    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Listeners whose query reads one of the given collections, in
    /// registration order.
    pub(crate) fn watching(
        &self,
        collections: &HashSet<String>,
    ) -> Vec<(ListenerId, &Query, &ListenSink)> {
        let mut matched: Vec<_> = self
            .listeners
            .iter()
            .filter(|(_, listener)| collections.contains(&listener.query.collection))
            .map(|(id, listener)| (*id, &listener.query, &listener.sink))
            .collect();
        matched.sort_by_key(|(id, _, _)| *id);
        matched
    }
}
