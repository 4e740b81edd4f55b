use crate::contact::Contact;
use crate::key::Key;

/// Accumulator for the `k` contacts closest to a target key by XOR distance.
///
/// Buckets offer their entries in whatever order they are visited; the
/// accumulator keeps the running set sorted by distance and bounded by `k`,
/// so callers need not order their contributions.
#[derive(Debug)]
pub struct KClosestSearch {
    target: Key,
    k: usize,
    contacts: Vec<Contact>,
}

impl KClosestSearch {
    /// Constructs a new, empty search for the `k` contacts closest to
    /// `target`.
    pub fn new(target: Key, k: usize) -> Self {
        KClosestSearch {
            target,
            k,
            contacts: Vec::new(),
        }
    }

    pub fn target(&self) -> &Key {
        &self.target
    }

    /// Offers a contact to the search. Duplicates and contacts farther from
    /// the target than the current k-th closest are discarded.
    pub fn add(&mut self, contact: Contact) {
        if self.contacts.contains(&contact) {
            return;
        }
        self.contacts.push(contact);
        let target = self.target;
        self.contacts.sort_by_key(|c| c.id.distance(&target));
        self.contacts.truncate(self.k);
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// Consumes the search and returns the collected contacts, closest
    /// first.
    pub fn into_contacts(self) -> Vec<Contact> {
        self.contacts
    }
}
