//! Wildcard signature scanning over byte buffers and module images.

use std::fmt;

use memchr::memchr_iter;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::signature::ByteSignature;

/// A contiguous address range `[base, base + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryRegion {
    pub base: usize,
    pub len: usize,
}

impl MemoryRegion {
    pub const fn new(base: usize, len: usize) -> Self {
        Self { base, len }
    }

    pub fn end(&self) -> usize {
        self.base.saturating_add(self.len)
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.base && address < self.end()
    }

    /// Whether `[address, address + len)` lies entirely inside the region.
    pub fn contains_range(&self, address: usize, len: usize) -> bool {
        match address.checked_add(len) {
            Some(end) => address >= self.base && end <= self.end(),
            None => false,
        }
    }

    pub fn address_of(&self, offset: usize) -> usize {
        self.base + offset
    }

    pub fn offset_of(&self, address: usize) -> Option<usize> {
        self.contains(address).then(|| address - self.base)
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}..{:#x})", self.base, self.end())
    }
}

/// Which match to report when a signature occurs more than once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Occurrence {
    #[default]
    First,
    /// Zero-based index into the ordered list of matches.
    Nth(usize),
    Last,
}

/// Offset of the lowest-address match of `sig` in `haystack`.
pub fn find(haystack: &[u8], sig: &ByteSignature) -> Option<usize> {
    matches(haystack, sig).next()
}

pub fn find_nth(haystack: &[u8], sig: &ByteSignature, n: usize) -> Option<usize> {
    matches(haystack, sig).nth(n)
}

pub fn find_all(haystack: &[u8], sig: &ByteSignature) -> Vec<usize> {
    matches(haystack, sig).collect()
}

pub fn find_occurrence(
    haystack: &[u8],
    sig: &ByteSignature,
    occurrence: Occurrence,
) -> Option<usize> {
    match occurrence {
        Occurrence::First => find(haystack, sig),
        Occurrence::Nth(n) => find_nth(haystack, sig, n),
        Occurrence::Last => matches(haystack, sig).last(),
    }
}

/// Iterator over every match offset, in ascending order.
///
/// Candidates are located with `memchr` on the first concrete byte of the
/// signature, then verified in full. An all-wildcard signature matches at
/// every offset where it fits.
pub fn matches<'a>(
    haystack: &'a [u8],
    sig: &'a ByteSignature,
) -> Box<dyn Iterator<Item = usize> + 'a> {
    if haystack.len() < sig.len() {
        return Box::new(std::iter::empty());
    }
    let last = haystack.len() - sig.len();

    match sig.anchor() {
        None => Box::new(0..=last),
        Some((anchor_index, anchor_byte)) => {
            let search_end = last + anchor_index + 1;
            Box::new(
                memchr_iter(anchor_byte, &haystack[anchor_index..search_end])
                    .filter(move |&start| sig.matches(&haystack[start..])),
            )
        }
    }
}

/// Outcome of scanning several named signatures over one image.
#[derive(Debug, Clone)]
pub struct BatchScan {
    pub region: MemoryRegion,
    pub results: Vec<(String, Option<usize>)>,
}

impl BatchScan {
    pub fn run<'s, I>(haystack: &[u8], region: MemoryRegion, signatures: I) -> Self
    where
        I: IntoIterator<Item = (&'s str, &'s ByteSignature, Occurrence)>,
    {
        let results = signatures
            .into_iter()
            .map(|(name, sig, occurrence)| {
                let found = find_occurrence(haystack, sig, occurrence)
                    .map(|offset| region.address_of(offset));
                match found {
                    Some(address) => info!("Found signature '{}' at {:#x}", name, address),
                    None => error!("Signature '{}' not found: {}", name, sig),
                }
                (name.to_string(), found)
            })
            .collect();

        Self { region, results }
    }

    pub fn all_found(&self) -> bool {
        self.results.iter().all(|(_, found)| found.is_some())
    }

    pub fn missing(&self) -> impl Iterator<Item = &str> {
        self.results
            .iter()
            .filter(|(_, found)| found.is_none())
            .map(|(name, _)| name.as_str())
    }

    /// Addresses of every signature, or the first missing one as an error.
    ///
    /// A batch with any missing signature yields no addresses at all.
    pub fn require_all(&self, patterns: &[&ByteSignature]) -> Result<Vec<usize>> {
        let mut addresses = Vec::with_capacity(self.results.len());
        for (index, (name, found)) in self.results.iter().enumerate() {
            match found {
                Some(address) => addresses.push(*address),
                None => {
                    debug!(
                        "Batch scan over {} failed at entry {} of {}",
                        self.region,
                        index + 1,
                        self.results.len()
                    );
                    return Err(Error::SignatureNotFound {
                        site: name.clone(),
                        pattern: patterns
                            .get(index)
                            .map(|sig| sig.to_string())
                            .unwrap_or_default(),
                    });
                }
            }
        }
        Ok(addresses)
    }
}

/// Scan a batch of signatures and return all addresses, or fail as a whole.
pub fn scan_batch(
    haystack: &[u8],
    region: MemoryRegion,
    signatures: &[(&str, &ByteSignature)],
) -> Result<Vec<usize>> {
    let batch = BatchScan::run(
        haystack,
        region,
        signatures
            .iter()
            .map(|(name, sig)| (*name, *sig, Occurrence::First)),
    );
    let patterns: Vec<&ByteSignature> = signatures.iter().map(|(_, sig)| *sig).collect();
    batch.require_all(&patterns)
}
