//! Awareness registry: ephemeral per-document presence.
//!
//! Each document keeps a table of Yjs client ids → `(clock, JSON state)`.
//! A client id is owned by the connection that first announced it, so that
//! all of a connection's entries can be dropped (and a removal delta
//! broadcast) the moment it disconnects. Nothing here is ever persisted.
//!
//! Merge rules follow y-protocols: an entry is accepted when its clock is
//! newer than the known one, or equal with a `null` state removing a live
//! entry. A `null` state means "client gone". Entries naming a live client
//! owned by another connection are rejected.
//!
//! Updates use the yrs wire types; only the merge and ownership rules live
//! here.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::broadcast::ConnectionId;

pub use yrs::sync::awareness::{AwarenessUpdate, AwarenessUpdateEntry};

/// JSON literal used on the wire to mark a removed client.
pub const REMOVED_STATE: &str = "null";

/// Whether an entry announces that its client is gone.
pub fn is_removal(entry: &AwarenessUpdateEntry) -> bool {
    entry.json.trim() == REMOVED_STATE
}

fn removal_entry(clock: u32) -> AwarenessUpdateEntry {
    AwarenessUpdateEntry { clock, json: Arc::from(REMOVED_STATE) }
}

/// Result of applying an update: which client ids changed and how.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
    /// Entries ignored because another connection owns the client.
    pub rejected: Vec<u64>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every client id touched by the change.
    pub fn changed_clients(&self) -> impl Iterator<Item = u64> + '_ {
        self.added
            .iter()
            .chain(self.updated.iter())
            .chain(self.removed.iter())
            .copied()
    }

    fn sort(&mut self) {
        self.added.sort_unstable();
        self.updated.sort_unstable();
        self.removed.sort_unstable();
        self.rejected.sort_unstable();
    }
}

#[derive(Debug, Clone)]
struct ClientState {
    state: Arc<str>,
    owner: ConnectionId,
}

/// Awareness table for a single document.
#[derive(Debug, Default)]
pub struct DocumentAwareness {
    /// Live states.
    states: HashMap<u64, ClientState>,
    /// Last accepted clock per client, kept after removal so stale updates
    /// cannot resurrect a departed client.
    clocks: HashMap<u64, u32>,
}

impl DocumentAwareness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a peer's update on behalf of `origin`.
    pub fn apply(&mut self, origin: ConnectionId, update: &AwarenessUpdate) -> AwarenessChange {
        let mut change = AwarenessChange::default();

        for (&client_id, entry) in &update.clients {
            if let Some(existing) = self.states.get(&client_id) {
                if existing.owner != origin {
                    log::debug!(
                        "Ignoring awareness for client {client_id} from {origin}: owned by {}",
                        existing.owner
                    );
                    change.rejected.push(client_id);
                    continue;
                }
            }

            let removal = is_removal(entry);
            let live = self.states.contains_key(&client_id);
            let accept = match self.clocks.get(&client_id) {
                None => true,
                Some(&known) => known < entry.clock || (known == entry.clock && removal && live),
            };
            if !accept {
                continue;
            }
            self.clocks.insert(client_id, entry.clock);

            if removal {
                if self.states.remove(&client_id).is_some() {
                    change.removed.push(client_id);
                }
                continue;
            }

            match self.states.get_mut(&client_id) {
                Some(existing) => {
                    if existing.state != entry.json {
                        existing.state = entry.json.clone();
                        change.updated.push(client_id);
                    }
                }
                None => {
                    self.states.insert(
                        client_id,
                        ClientState { state: entry.json.clone(), owner: origin },
                    );
                    change.added.push(client_id);
                }
            }
        }

        change.sort();
        change
    }

    /// Drop every client owned by `connection`, returning the removal update
    /// to broadcast (empty if the connection owned nothing).
    pub fn remove_connection(&mut self, connection: ConnectionId) -> AwarenessUpdate {
        let owned: Vec<u64> = self
            .states
            .iter()
            .filter(|(_, s)| s.owner == connection)
            .map(|(id, _)| *id)
            .collect();

        let mut clients = HashMap::with_capacity(owned.len());
        for client_id in owned {
            self.states.remove(&client_id);
            let clock = self.clocks.get(&client_id).copied().unwrap_or(0).wrapping_add(1);
            self.clocks.insert(client_id, clock);
            clients.insert(client_id, removal_entry(clock));
        }
        AwarenessUpdate { clients }
    }

    /// Current entries of the given clients. Clients without a live state
    /// are encoded as removals.
    pub fn encode_clients(&self, clients: impl IntoIterator<Item = u64>) -> AwarenessUpdate {
        let clients = clients
            .into_iter()
            .map(|client_id| {
                let clock = self.clocks.get(&client_id).copied().unwrap_or(0);
                let entry = match self.states.get(&client_id) {
                    Some(s) => AwarenessUpdateEntry { clock, json: s.state.clone() },
                    None => removal_entry(clock),
                };
                (client_id, entry)
            })
            .collect();
        AwarenessUpdate { clients }
    }

    /// Full snapshot of live states, for newly joined connections.
    pub fn snapshot(&self) -> AwarenessUpdate {
        self.encode_clients(self.states.keys().copied())
    }

    pub fn state(&self, client_id: u64) -> Option<&str> {
        self.states.get(&client_id).map(|s| &*s.state)
    }

    pub fn owner(&self, client_id: u64) -> Option<ConnectionId> {
        self.states.get(&client_id).map(|s| s.owner)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Registry of awareness tables keyed by document id.
#[derive(Default)]
pub struct AwarenessRegistry {
    documents: RwLock<HashMap<String, Arc<Mutex<DocumentAwareness>>>>,
}

impl AwarenessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the table for a document.
    pub async fn document(&self, document_id: &str) -> Arc<Mutex<DocumentAwareness>> {
        {
            let docs = self.documents.read().await;
            if let Some(doc) = docs.get(document_id) {
                return doc.clone();
            }
        }
        let mut docs = self.documents.write().await;
        docs.entry(document_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(DocumentAwareness::new())))
            .clone()
    }

    /// Apply an update from `origin` to the document's table.
    pub async fn apply(
        &self,
        document_id: &str,
        origin: ConnectionId,
        update: &AwarenessUpdate,
    ) -> AwarenessChange {
        let doc = self.document(document_id).await;
        let mut table = doc.lock().await;
        table.apply(origin, update)
    }

    /// Remove a departed connection's entries. Returns `None` when there is
    /// nothing to broadcast.
    pub async fn remove_connection(
        &self,
        document_id: &str,
        connection: ConnectionId,
    ) -> Option<AwarenessUpdate> {
        let doc = {
            let docs = self.documents.read().await;
            docs.get(document_id).cloned()
        }?;
        let update = doc.lock().await.remove_connection(connection);
        (!update.clients.is_empty()).then_some(update)
    }

    /// Snapshot of live states, `None` when the document has none.
    pub async fn snapshot(&self, document_id: &str) -> Option<AwarenessUpdate> {
        let doc = {
            let docs = self.documents.read().await;
            docs.get(document_id).cloned()
        }?;
        let snapshot = doc.lock().await.snapshot();
        (!snapshot.clients.is_empty()).then_some(snapshot)
    }

    /// Drop a document's table if it holds no live state.
    pub async fn remove_document_if_idle(&self, document_id: &str) -> bool {
        let mut docs = self.documents.write().await;
        let idle = match docs.get(document_id) {
            Some(doc) => doc.lock().await.is_empty(),
            None => return false,
        };
        if idle {
            docs.remove(document_id);
        }
        idle
    }

    pub async fn document_count(&self) -> usize {
        self.documents.read().await.len()
    }
}
