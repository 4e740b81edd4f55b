//! The routing-table core of a Kademlia DHT node.
//!
//! A [`RoutingTable`] owns one optional k-bucket per bit of the 160-bit
//! identifier space. Inbound contacts and query timeouts are classified by
//! XOR distance to the local identifier and dispatched to the covering
//! bucket; stale buckets are repopulated by asking the surrounding engine
//! (via [`DhtEngine`]) to look up a synthetic key in the bucket's range.
//! The table and the local identity can be persisted across restarts.

mod bucket;
mod contact;
mod error;
mod key;
mod routing;
mod search;

pub use self::bucket::{KBucket, RefreshTask};
pub use self::contact::Contact;
pub use self::error::TableError;
pub use self::key::Key;
pub use self::routing::{DhtEngine, RoutingTable};
pub use self::search::KClosestSearch;

/// The number of bytes in a key.
const KEY_LENGTH: usize = 20;

/// The number of bucket slots in the routing table, one per key bit.
const ROUTING_TABLE_SIZE: usize = KEY_LENGTH * 8;

/// The maximum number of entries in a k-bucket.
const REPLICATION_PARAM: usize = 20;

/// Bucket refresh interval in seconds.
const BUCKET_REFRESH_INTERVAL: u64 = 3600;

/// The number of timed-out queries after which a bucket entry becomes
/// replaceable.
const MAX_FAILED_QUERIES: u8 = 2;

/// Legacy on-disk format tag. Records are written with this value plus one,
/// marking the address-family-capable entry format.
const BUCKET_MAGIC_NUMBER: u32 = 0xB0C4_B0C4;
