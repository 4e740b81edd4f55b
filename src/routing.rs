use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use log::{debug, info, warn};

use crate::bucket::{BucketHeader, KBucket, RefreshTask};
use crate::contact::Contact;
use crate::error::TableError;
use crate::key::Key;
use crate::search::KClosestSearch;
use crate::{KEY_LENGTH, ROUTING_TABLE_SIZE};

/// The number of insertions after which the table asks the engine to look up
/// the local identifier, seeding the table from the first live contacts.
const BOOTSTRAP_INSERTION_COUNT: u64 = 3;

/// The surrounding DHT engine, as seen by the routing table.
///
/// The table never performs network lookups itself. It asks the engine to
/// schedule them and learns their outcome through later
/// [`RoutingTable::on_contact_observed`] and [`RoutingTable::on_timeout`]
/// calls.
pub trait DhtEngine {
    /// Requests a lookup for the local identifier.
    fn request_self_lookup(&mut self);

    /// Requests a lookup for `target` to repopulate the bucket at `index`.
    /// Returns a task handle when a lookup was scheduled.
    fn request_bucket_refresh(&mut self, target: Key, index: usize) -> Option<RefreshTask>;
}

/// A node's routing table: one optional k-bucket per bit of the identifier
/// space.
///
/// Slot `i` covers the identifiers whose XOR distance to the local
/// identifier has its first set bit at position `i`, counted from the most
/// significant end. Buckets are created lazily when the first contact in
/// their range arrives and live for the rest of the run, even when eviction
/// empties them.
///
/// All mutating operations must be serialized by the caller; the table is a
/// passive, single-writer structure driven by the engine's event loop.
pub struct RoutingTable {
    local_id: Key,
    buckets: Vec<Option<KBucket>>,
    total_entry_count: u32,
    insertion_count: u64,
    fresh_identity: bool,
}

impl RoutingTable {
    /// Constructs a routing table, loading the local identifier from
    /// `key_file`. When the file is missing or unreadable, a fresh
    /// identifier is generated and written back, and the table is marked as
    /// having a fresh identity.
    pub fn new(key_file: &Path) -> Self {
        let (local_id, fresh_identity) = load_key(key_file);
        let mut buckets = Vec::with_capacity(ROUTING_TABLE_SIZE);
        for _ in 0..ROUTING_TABLE_SIZE {
            buckets.push(None);
        }
        RoutingTable {
            local_id,
            buckets,
            total_entry_count: 0,
            insertion_count: 0,
            fresh_identity,
        }
    }

    pub fn local_id(&self) -> &Key {
        &self.local_id
    }

    /// Returns `true` when the local identifier was generated this run
    /// rather than loaded, which invalidates any previously persisted table.
    pub fn is_fresh_identity(&self) -> bool {
        self.fresh_identity
    }

    /// Returns the number of entries across all buckets.
    pub fn total_entry_count(&self) -> u32 {
        self.total_entry_count
    }

    /// Returns the bucket slot covering `id`, or `None` for the local
    /// identifier itself, whose zero distance has no first set bit.
    pub fn bucket_index(&self, id: &Key) -> Option<usize> {
        let index = id.distance(&self.local_id).leading_zeros();
        if index >= ROUTING_TABLE_SIZE {
            None
        } else {
            Some(index)
        }
    }

    /// Records a contact observed on the wire, creating its bucket on first
    /// use. Observations of the local identifier are discarded before any
    /// counter is touched.
    ///
    /// The third insertion of the table's lifetime asks the engine for a
    /// lookup of the local identifier, the one-time bootstrap that fills in
    /// the neighborhood once a handful of live contacts is known.
    pub fn on_contact_observed<E: DhtEngine>(&mut self, contact: Contact, engine: &mut E) {
        let index = match self.bucket_index(&contact.id) {
            Some(index) => index,
            None => return,
        };

        let bucket = self.buckets[index].get_or_insert_with(|| KBucket::new(index));
        bucket.insert(contact);

        self.insertion_count += 1;
        if self.insertion_count == BOOTSTRAP_INSERTION_COUNT {
            engine.request_self_lookup();
        }

        // recount rather than trust an incremental counter; the bucket may
        // have dropped the insertion
        self.total_entry_count = self
            .buckets
            .iter()
            .flatten()
            .map(KBucket::entry_count)
            .sum();
    }

    /// Offers every bucket's entries to `search`, in slot order.
    pub fn collect_k_closest(&self, search: &mut KClosestSearch) {
        for bucket in self.buckets.iter().flatten() {
            bucket.find_k_closest(search);
        }
    }

    /// Records a query timeout for `addr`. An origin lives in at most one
    /// bucket, so the scan stops at the first bucket that claims it.
    pub fn on_timeout(&mut self, addr: &str) {
        for bucket in self.buckets.iter_mut().flatten() {
            if bucket.on_timeout(addr) {
                return;
            }
        }
    }

    /// Asks the engine to look up a random key in the range of every stale
    /// bucket. A scheduled lookup's handle is attached to the bucket, which
    /// suppresses further refreshes until the lookup finishes.
    pub fn refresh_stale_buckets<E: DhtEngine>(&mut self, engine: &mut E) {
        for bucket in self.buckets.iter_mut().flatten() {
            if bucket.needs_refresh() {
                let target = Key::rand_in_bucket(bucket.index(), &self.local_id);
                if let Some(task) = engine.request_bucket_refresh(target, bucket.index()) {
                    bucket.attach_refresh_task(task);
                }
            }
        }
    }

    /// Restores buckets from the table file at `path`.
    ///
    /// A fresh identity invalidates every previously learned distance, so
    /// the persisted table is deleted instead of read. Otherwise records are
    /// read until a clean end of stream; loading stops at the first
    /// malformed record, keeping the buckets restored before it. A missing
    /// table file is not an error.
    pub fn load_table(&mut self, path: &Path) -> Result<(), TableError> {
        if self.fresh_identity {
            self.fresh_identity = false;
            info!("new identity, removing routing table {}", path.display());
            if path.exists() {
                fs::remove_file(path)?;
            }
            return Ok(());
        }

        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) => {
                warn!("cannot open routing table {}: {}", path.display(), err);
                return Ok(());
            },
        };
        let mut reader = BufReader::new(file);

        self.total_entry_count = 0;
        while let Some(header) = BucketHeader::read_from(&mut reader)? {
            header.validate()?;
            if header.num_entries == 0 {
                continue;
            }

            let index = header.index as usize;
            debug!("loading bucket {} with {} entries", index, header.num_entries);
            let mut bucket = KBucket::new(index);
            bucket.load(&mut reader, header.num_entries)?;
            self.total_entry_count += bucket.entry_count();
            self.buckets[index] = Some(bucket);
        }
        Ok(())
    }

    /// Writes every present bucket's record to the table file at `path`, in
    /// slot order. A failed save leaves a possibly-partial file behind;
    /// callers must not treat it as a rollback.
    pub fn save_table(&self, path: &Path) -> Result<(), TableError> {
        let mut writer = BufWriter::new(File::create(path)?);
        for bucket in self.buckets.iter().flatten() {
            bucket.save(&mut writer)?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn save_key(key: &Key, key_file: &Path) {
    if let Err(err) = fs::write(key_file, &key.0) {
        warn!("cannot write key file {}: {}", key_file.display(), err);
    }
}

/// Loads the node identifier from `key_file`, generating and persisting a
/// fresh one when the file is missing or unreadable. The second value is
/// `true` when a new identifier was generated.
fn load_key(key_file: &Path) -> (Key, bool) {
    let mut data = [0u8; KEY_LENGTH];
    match File::open(key_file) {
        Ok(mut file) => match file.read_exact(&mut data) {
            Ok(()) => (Key::new(data), false),
            Err(err) => {
                warn!("short read on key file {}: {}", key_file.display(), err);
                let key = Key::rand();
                save_key(&key, key_file);
                (key, true)
            },
        },
        Err(err) => {
            info!("cannot open key file {}: {}", key_file.display(), err);
            let key = Key::rand();
            save_key(&key, key_file);
            (key, true)
        },
    }
}
