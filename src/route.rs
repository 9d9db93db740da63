use std::path::PathBuf;

use crate::delivery::{Destination, FileDestination};

/// One configured recipient-to-destination mapping.
pub struct MappingEntry {
    pub address: String,
    pub destination: Destination,
}

/// The routing table: ordered mapping entries plus the optional default
/// filesystem path for recipients no entry claims. Built once at startup,
/// shared read-only with every connection task.
pub struct RouteTable {
    entries: Vec<MappingEntry>,
    default: Option<Destination>,
}

impl RouteTable {
    pub fn new(entries: Vec<MappingEntry>, default_path: Option<PathBuf>) -> Self {
        Self {
            entries,
            default: default_path.map(|dir| Destination::File(FileDestination::new(dir))),
        }
    }

    /// Resolves a recipient to its destination. The first matching entry
    /// wins; configuration order is significant. Falls back to the
    /// default path, and returns `None` for unroutable recipients, which
    /// must be rejected at RCPT time.
    pub fn route(&self, recipient: &str) -> Option<&Destination> {
        self.entries
            .iter()
            .find(|entry| addresses_match(&entry.address, recipient))
            .map(|entry| &entry.destination)
            .or(self.default.as_ref())
    }
}

/// Address comparison per common SMTP practice: the local part is
/// case-sensitive, the domain part is not.
fn addresses_match(configured: &str, candidate: &str) -> bool {
    match (configured.rsplit_once('@'), candidate.rsplit_once('@')) {
        (Some((local_a, domain_a)), Some((local_b, domain_b))) => {
            local_a == local_b && domain_a.eq_ignore_ascii_case(domain_b)
        }
        (None, None) => configured == candidate,
        _ => false,
    }
}
