use serde_derive::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter, Result};

use crate::key::Key;

/// A peer known to the routing table: the network origin a message arrived
/// from, paired with the identifier the peer claims.
#[derive(PartialEq, Eq, Hash, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub addr: String,
    pub id: Key,
}

impl Contact {
    pub fn new(addr: String, id: Key) -> Self {
        Contact { addr, id }
    }
}

impl Debug for Contact {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "{} - {:?}", self.addr, self.id)
    }
}
