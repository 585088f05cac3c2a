//! Longest-prefix-match sets for destination filtering.
//!
//! IPv4 and IPv6 prefixes live in separate tries. The set is loaded once at
//! startup and only read afterwards, so concurrent lookups need no locking.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use anyhow::{Context, Result};
use ip_network_table_deps_treebitmap::IpLookupTable;
use ipnetwork::IpNetwork;

/// Membership-only set of CIDR prefixes with longest-prefix-match lookup.
pub struct PrefixSet {
    v4: IpLookupTable<Ipv4Addr, ()>,
    v6: IpLookupTable<Ipv6Addr, ()>,
}

impl Default for PrefixSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PrefixSet {
    pub fn new() -> Self {
        Self {
            v4: IpLookupTable::new(),
            v6: IpLookupTable::new(),
        }
    }

    /// Insert a prefix. The address is masked to its network address first.
    pub fn insert(&mut self, prefix: IpNetwork) {
        match prefix {
            IpNetwork::V4(network) => {
                self.v4
                    .insert(network.network(), u32::from(network.prefix()), ());
            }
            IpNetwork::V6(network) => {
                self.v6
                    .insert(network.network(), u32::from(network.prefix()), ());
            }
        }
    }

    /// Load prefixes from a file of `CIDR` lines (bare addresses get a full
    /// length prefix). `#` starts a comment; blank lines are ignored.
    /// A malformed line fails the whole load with file and line context.
    pub fn insert_file(&mut self, path: &Path) -> Result<()> {
        let file = File::open(path)
            .with_context(|| format!("failed to open prefix file {}", path.display()))?;
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line =
                line.with_context(|| format!("failed to read {}", path.display()))?;
            let entry = line.split('#').next().unwrap_or("").trim();
            if entry.is_empty() {
                continue;
            }
            let prefix: IpNetwork = entry.parse().with_context(|| {
                format!("{}:{}: invalid prefix '{entry}'", path.display(), index + 1)
            })?;
            self.insert(prefix);
        }
        Ok(())
    }

    /// Whether any stored prefix covers `addr`.
    pub fn lookup(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(addr) => self.v4.longest_match(addr).is_some(),
            IpAddr::V6(addr) => self.v6.longest_match(addr).is_some(),
        }
    }

    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
