use std::collections::{BTreeSet, HashMap};

use tracing::{info, warn};

use crate::error::{LayoutError, Result};
use crate::header::{HeaderState, StripeHeader};
use crate::map::StripeMap;

/// Validation is the outcome of header validation at open time.
#[derive(Debug)]
pub struct Validation {
    pub map: StripeMap,
    /// Physical stripes whose header was rebuilt, in the order they were repaired.
    pub repaired: Vec<usize>,
    /// No stripe carried a valid header.
    pub new_file: bool,
}

impl Validation {
    #[must_use]
    pub fn recovered(&self) -> bool {
        !self.repaired.is_empty()
    }
}

/// Build the stripe map from the headers read at open time, repairing
/// invalid headers when parity allows.
///
/// Invalid stripes are handled from the last discovered to the first; each takes the lowest
/// logical index not claimed yet and copies its block count and last block size from the last
/// valid header. Repaired headers are updated in memory only.
///
/// # Errors
/// Returns [`LayoutError::HeaderCorrupt`] if more headers are invalid than `parity` covers.
pub fn validate_headers(headers: &mut [StripeHeader], parity: usize) -> Result<Validation> {
    let n = headers.len();
    screen_inconsistent(headers);

    let mut invalid: Vec<usize> = (0..n).filter(|&p| !headers[p].is_valid()).collect();

    if invalid.len() == n {
        if headers.iter().any(|h| h.state() == HeaderState::Corrupt) {
            warn!("no valid stripe header found, treating file as new");
        }
        for (physical, header) in headers.iter_mut().enumerate() {
            header.set_logical_index(physical);
        }
        return Ok(Validation {
            map: StripeMap::identity(n),
            repaired: Vec::new(),
            new_file: true,
        });
    }

    if invalid.len() > parity {
        return Err(LayoutError::HeaderCorrupt {
            invalid: invalid.len(),
            parity,
        });
    }

    let mut logical_of = vec![usize::MAX; n];
    let mut used = BTreeSet::new();
    let mut reference = 0;
    for (physical, header) in headers.iter().enumerate() {
        if header.is_valid() {
            logical_of[physical] = header.logical_index();
            used.insert(header.logical_index());
            reference = physical;
        }
    }
    let block_count = headers[reference].block_count();
    let last_block_size = headers[reference].last_block_size();

    let mut repaired = Vec::with_capacity(invalid.len());
    while let Some(physical) = invalid.pop() {
        let Some(free) = (0..n).find(|l| !used.contains(l)) else {
            break;
        };
        used.insert(free);
        logical_of[physical] = free;
        headers[physical].assign(free, block_count, last_block_size);
        info!(stripe = physical, logical = free, "recovered stripe header");
        repaired.push(physical);
    }

    let map = StripeMap::from_logical(logical_of).ok_or(LayoutError::HeaderCorrupt {
        invalid: repaired.len(),
        parity,
    })?;
    Ok(Validation {
        map,
        repaired,
        new_file: false,
    })
}

/// Valid headers that cannot belong to a consistent file are demoted to corrupt: logical index
/// out of range, logical index already claimed by an earlier stripe, or a block count and last
/// block size that disagree with the majority.
fn screen_inconsistent(headers: &mut [StripeHeader]) {
    let n = headers.len();
    let mut claimed = vec![false; n];
    for (physical, header) in headers.iter_mut().enumerate() {
        if !header.is_valid() {
            continue;
        }
        let logical = header.logical_index();
        if logical >= n || claimed[logical] {
            warn!(stripe = physical, logical, "stripe header claims an unusable logical index");
            header.mark_corrupt();
        } else {
            claimed[logical] = true;
        }
    }

    let mut votes: HashMap<(u64, u64), usize> = HashMap::new();
    let mut order = Vec::new();
    for header in headers.iter().filter(|h| h.is_valid()) {
        let key = (header.block_count(), header.last_block_size());
        let count = votes.entry(key).or_insert(0);
        if *count == 0 {
            order.push(key);
        }
        *count += 1;
    }
    let mut majority = None;
    let mut best = 0;
    for key in order {
        if votes[&key] > best {
            best = votes[&key];
            majority = Some(key);
        }
    }
    let Some(majority) = majority else {
        return;
    };
    for (physical, header) in headers.iter_mut().enumerate() {
        if header.is_valid() && (header.block_count(), header.last_block_size()) != majority {
            warn!(stripe = physical, "stripe header disagrees with its siblings on file size");
            header.mark_corrupt();
        }
    }
}
