use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use time::{Duration, SteadyTime};

use crate::contact::Contact;
use crate::error::TableError;
use crate::search::KClosestSearch;
use crate::{
    BUCKET_MAGIC_NUMBER, BUCKET_REFRESH_INTERVAL, MAX_FAILED_QUERIES, REPLICATION_PARAM,
    ROUTING_TABLE_SIZE,
};

/// Handle on an outstanding bucket-refresh lookup.
///
/// The engine keeps one clone and marks it finished when the lookup
/// completes; the bucket holds the other and reports "not stale" while the
/// lookup is still in flight, so at most one refresh per bucket is
/// outstanding at a time.
#[derive(Clone, Debug, Default)]
pub struct RefreshTask {
    finished: Arc<AtomicBool>,
}

impl RefreshTask {
    pub fn new() -> Self {
        RefreshTask {
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Marks the lookup as complete, making the bucket eligible for refresh
    /// again once it goes stale.
    pub fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

/// On-disk record header preceding a bucket's serialized entries.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct BucketHeader {
    pub magic: u32,
    pub num_entries: u32,
    pub index: u32,
}

impl BucketHeader {
    pub const SIZE: usize = 12;

    pub fn write_to(&self, writer: &mut impl Write) -> Result<(), TableError> {
        writer.write_all(&self.magic.to_le_bytes())?;
        writer.write_all(&self.num_entries.to_le_bytes())?;
        writer.write_all(&self.index.to_le_bytes())?;
        Ok(())
    }

    /// Reads the next header, returning `None` at a clean end of stream. A
    /// stream ending partway through a header is reported as truncated.
    pub fn read_from(reader: &mut impl Read) -> Result<Option<BucketHeader>, TableError> {
        let mut buf = [0u8; Self::SIZE];
        let mut filled = 0;
        while filled < Self::SIZE {
            let n = reader.read(&mut buf[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(TableError::TruncatedHeader);
            }
            filled += n;
        }
        Ok(Some(BucketHeader {
            magic: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            num_entries: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            index: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
        }))
    }

    /// Checks the declared fields against the current format tag, the bucket
    /// capacity, and the number of table slots.
    pub fn validate(&self) -> Result<(), TableError> {
        if self.magic != BUCKET_MAGIC_NUMBER + 1 {
            return Err(TableError::BadMagic { found: self.magic });
        }
        if self.num_entries as usize > REPLICATION_PARAM {
            return Err(TableError::TooManyEntries {
                count: self.num_entries,
                max: REPLICATION_PARAM as u32,
            });
        }
        if self.index as usize >= ROUTING_TABLE_SIZE {
            return Err(TableError::IndexOutOfRange { index: self.index });
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct BucketEntry {
    contact: Contact,
    failed_queries: u8,
}

/// A k-bucket holding up to `REPLICATION_PARAM` contacts whose distance to
/// the local identifier has its first set bit at this bucket's index.
///
/// Entries are kept in least-recently-seen order, with the most recently
/// seen contact at the end of the list.
#[derive(Debug)]
pub struct KBucket {
    index: usize,
    entries: Vec<BucketEntry>,
    last_modified: SteadyTime,
    refresh_task: Option<RefreshTask>,
}

impl KBucket {
    /// Constructs a new, empty `KBucket` covering slot `index`.
    pub fn new(index: usize) -> Self {
        KBucket {
            index,
            entries: Vec::new(),
            last_modified: SteadyTime::now(),
            refresh_task: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Inserts a contact into the bucket. A contact already present moves to
    /// the end of the list with its failure count reset. When the bucket is
    /// full, the oldest unresponsive entry is replaced; if every entry is
    /// still healthy the insertion is dropped silently.
    pub fn insert(&mut self, contact: Contact) {
        self.last_modified = SteadyTime::now();
        if let Some(index) = self.entries.iter().position(|e| e.contact == contact) {
            let mut entry = self.entries.remove(index);
            entry.failed_queries = 0;
            self.entries.push(entry);
            return;
        }
        if self.entries.len() < REPLICATION_PARAM {
            self.entries.push(BucketEntry {
                contact,
                failed_queries: 0,
            });
            return;
        }
        if let Some(index) = self
            .entries
            .iter()
            .position(|e| e.failed_queries >= MAX_FAILED_QUERIES)
        {
            self.entries.remove(index);
            self.entries.push(BucketEntry {
                contact,
                failed_queries: 0,
            });
        }
    }

    /// Returns the number of entries in the bucket.
    pub fn entry_count(&self) -> u32 {
        self.entries.len() as u32
    }

    /// Offers every entry in the bucket to the accumulator.
    pub fn find_k_closest(&self, search: &mut KClosestSearch) {
        for entry in &self.entries {
            search.add(entry.contact.clone());
        }
    }

    /// Records a query timeout for `addr`. Returns `true` if this bucket owns
    /// a contact at that origin.
    pub fn on_timeout(&mut self, addr: &str) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.contact.addr == addr) {
            entry.failed_queries = entry.failed_queries.saturating_add(1);
            true
        } else {
            false
        }
    }

    /// Returns `true` if the bucket is non-empty, has been idle longer than
    /// `BUCKET_REFRESH_INTERVAL`, and has no refresh lookup in flight.
    pub fn needs_refresh(&self) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        if let Some(task) = &self.refresh_task {
            if !task.is_finished() {
                return false;
            }
        }
        SteadyTime::now() - self.last_modified > Duration::seconds(BUCKET_REFRESH_INTERVAL as i64)
    }

    /// Attaches the handle of a refresh lookup in flight, superseding any
    /// previous one.
    pub fn attach_refresh_task(&mut self, task: RefreshTask) {
        self.refresh_task = Some(task);
    }

    /// Writes the bucket's header-plus-entries record to `writer`.
    pub fn save(&self, writer: &mut impl Write) -> Result<(), TableError> {
        let header = BucketHeader {
            magic: BUCKET_MAGIC_NUMBER + 1,
            num_entries: self.entry_count(),
            index: self.index as u32,
        };
        header.write_to(writer)?;
        for entry in &self.entries {
            bincode::serialize_into(&mut *writer, &entry.contact)?;
        }
        Ok(())
    }

    /// Reads exactly `declared_count` serialized contacts from `reader` into
    /// the bucket, with failure counts reset.
    pub fn load(&mut self, reader: &mut impl Read, declared_count: u32) -> Result<(), TableError> {
        for _ in 0..declared_count {
            let contact: Contact = bincode::deserialize_from(&mut *reader)?;
            self.entries.push(BucketEntry {
                contact,
                failed_queries: 0,
            });
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn failed_query_count(&self, addr: &str) -> Option<u8> {
        self.entries
            .iter()
            .find(|e| e.contact.addr == addr)
            .map(|e| e.failed_queries)
    }

    #[cfg(test)]
    pub(crate) fn age(&mut self, seconds: i64) {
        self.last_modified = SteadyTime::now() - Duration::seconds(seconds);
    }
}

#[cfg(test)]
mod tests {
    use super::{BucketHeader, KBucket, RefreshTask};
    use crate::contact::Contact;
    use crate::error::TableError;
    use crate::key::Key;
    use crate::{
        BUCKET_MAGIC_NUMBER, BUCKET_REFRESH_INTERVAL, MAX_FAILED_QUERIES, REPLICATION_PARAM,
    };

    fn contact(index: u8) -> Contact {
        let mut data = [0u8; crate::KEY_LENGTH];
        data[crate::KEY_LENGTH - 1] = index;
        Contact::new(format!("127.0.0.1:{}", 8000 + u16::from(index)), Key::new(data))
    }

    #[test]
    fn test_insert_moves_existing_to_back() {
        let mut bucket = KBucket::new(0);
        bucket.insert(contact(1));
        bucket.insert(contact(2));
        bucket.on_timeout(&contact(1).addr);
        bucket.insert(contact(1));

        assert_eq!(bucket.entry_count(), 2);
        assert_eq!(bucket.entries.last().unwrap().contact, contact(1));
        assert_eq!(bucket.failed_query_count(&contact(1).addr), Some(0));
    }

    #[test]
    fn test_insert_full_drops_when_all_healthy() {
        let mut bucket = KBucket::new(0);
        for i in 0..REPLICATION_PARAM as u8 {
            bucket.insert(contact(i));
        }
        bucket.insert(contact(200));

        assert_eq!(bucket.entry_count(), REPLICATION_PARAM as u32);
        assert_eq!(bucket.failed_query_count(&contact(200).addr), None);
    }

    #[test]
    fn test_insert_full_replaces_unresponsive_entry() {
        let mut bucket = KBucket::new(0);
        for i in 0..REPLICATION_PARAM as u8 {
            bucket.insert(contact(i));
        }
        for _ in 0..MAX_FAILED_QUERIES {
            bucket.on_timeout(&contact(3).addr);
        }
        bucket.insert(contact(200));

        assert_eq!(bucket.entry_count(), REPLICATION_PARAM as u32);
        assert_eq!(bucket.failed_query_count(&contact(3).addr), None);
        assert_eq!(bucket.failed_query_count(&contact(200).addr), Some(0));
    }

    #[test]
    fn test_on_timeout_unknown_origin() {
        let mut bucket = KBucket::new(0);
        bucket.insert(contact(1));
        assert!(!bucket.on_timeout("10.0.0.1:9999"));
        assert_eq!(bucket.failed_query_count(&contact(1).addr), Some(0));
    }

    #[test]
    fn test_needs_refresh() {
        let mut bucket = KBucket::new(0);
        assert!(!bucket.needs_refresh());

        bucket.insert(contact(1));
        assert!(!bucket.needs_refresh());

        bucket.age(BUCKET_REFRESH_INTERVAL as i64 + 1);
        assert!(bucket.needs_refresh());

        let task = RefreshTask::new();
        bucket.attach_refresh_task(task.clone());
        assert!(!bucket.needs_refresh());

        task.finish();
        bucket.age(BUCKET_REFRESH_INTERVAL as i64 + 1);
        assert!(bucket.needs_refresh());
    }

    #[test]
    fn test_save_load_round_trip() {
        let mut bucket = KBucket::new(17);
        for i in 0..3 {
            bucket.insert(contact(i));
        }

        let mut buf = Vec::new();
        bucket.save(&mut buf).unwrap();

        let mut reader = &buf[..];
        let header = BucketHeader::read_from(&mut reader).unwrap().unwrap();
        header.validate().unwrap();
        assert_eq!(header.num_entries, 3);
        assert_eq!(header.index, 17);

        let mut restored = KBucket::new(header.index as usize);
        restored.load(&mut reader, header.num_entries).unwrap();
        assert_eq!(restored.entry_count(), 3);
        for i in 0..3 {
            assert_eq!(restored.failed_query_count(&contact(i).addr), Some(0));
        }
    }

    #[test]
    fn test_header_read_clean_eof() {
        let mut reader: &[u8] = &[];
        assert!(BucketHeader::read_from(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_header_read_truncated() {
        let mut reader: &[u8] = &[0xC5, 0xB0, 0xC4, 0xB0, 0x01];
        match BucketHeader::read_from(&mut reader) {
            Err(TableError::TruncatedHeader) => {},
            other => panic!("expected truncated header, got {:?}", other),
        }
    }

    #[test]
    fn test_header_validate() {
        let good = BucketHeader {
            magic: BUCKET_MAGIC_NUMBER + 1,
            num_entries: REPLICATION_PARAM as u32,
            index: 159,
        };
        assert!(good.validate().is_ok());

        let legacy = BucketHeader {
            magic: BUCKET_MAGIC_NUMBER,
            ..good
        };
        assert!(matches!(legacy.validate(), Err(TableError::BadMagic { .. })));

        let overfull = BucketHeader {
            num_entries: REPLICATION_PARAM as u32 + 1,
            ..good
        };
        assert!(matches!(
            overfull.validate(),
            Err(TableError::TooManyEntries { .. })
        ));

        let out_of_range = BucketHeader { index: 160, ..good };
        assert!(matches!(
            out_of_range.validate(),
            Err(TableError::IndexOutOfRange { .. })
        ));
    }
}
