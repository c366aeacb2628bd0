/// In-memory session cache in front of the persistence service.
///
/// Every session loaded or created this process is kept here. The entry for
/// the active session is authoritative; the others are snapshots of what was
/// last sent to the service. Entries leave only through `delete`, which the
/// controller calls before the remote delete is issued. There is no eviction.
use std::collections::HashMap;

use crate::session::ChatSession;

#[derive(Debug, Default)]
pub struct SessionStore {
    entries: HashMap<String, ChatSession>,
}

impl SessionStore {
    pub fn get(&self, id: &str) -> Option<&ChatSession> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ChatSession> {
        self.entries.get_mut(id)
    }

    /// Insert or overwrite. Last writer wins.
    pub fn put(&mut self, id: impl Into<String>, session: ChatSession) {
        self.entries.insert(id.into(), session);
    }

    /// Remove an entry, returning it if it was cached.
    pub fn delete(&mut self, id: &str) -> Option<ChatSession> {
        self.entries.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }
}
