//! Friend relationships as seen by session recovery.
//!
//! The application owns contact persistence. Recovery only needs to read a
//! contact and create or upgrade one, so that is all the seam exposes.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

/// Relationship status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactStatus {
    /// Request sent or received, not yet accepted
    Pending,
    /// Mutual contacts
    Accepted,
}

/// One contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    /// Peer id
    pub peer: String,
    /// Name shown to the user
    pub display_name: String,
    /// Relationship status
    pub status: ContactStatus,
}

/// Contact storage owned by the application.
pub trait ContactBook: Send + Sync + 'static {
    /// Contact for `peer`, if any.
    fn contact(&self, peer: &str) -> Result<Option<Contact>, String>;

    /// Insert or replace a contact.
    fn upsert(&self, contact: Contact) -> Result<(), String>;
}

/// In-memory contact book.
#[derive(Clone, Default)]
pub struct MemoryContactBook {
    contacts: Arc<Mutex<HashMap<String, Contact>>>,
}

impl MemoryContactBook {
    /// Create an empty book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of contacts.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the book is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[allow(clippy::expect_used, reason = "poisoning means a writer panicked mid-update")]
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Contact>> {
        self.contacts.lock().expect("contact book lock poisoned")
    }
}

impl ContactBook for MemoryContactBook {
    fn contact(&self, peer: &str) -> Result<Option<Contact>, String> {
        Ok(self.lock().get(peer).cloned())
    }

    fn upsert(&self, contact: Contact) -> Result<(), String> {
        self.lock().insert(contact.peer.clone(), contact);
        Ok(())
    }
}
