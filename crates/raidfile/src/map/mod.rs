//! Logical/physical stripe index mapping.
//!
//! Logical indices `0..data` are the data stripes in round-robin order, followed by the parity
//! stripes. Physical indices are the order in which stripe channels were opened.

mod recovery;

pub use recovery::{Validation, validate_headers};

/// StripeMap is a bijection between physical and logical stripe indices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StripeMap {
    logical_of: Vec<usize>,
    physical_of: Vec<usize>,
}

impl StripeMap {
    #[must_use]
    pub fn identity(stripes: usize) -> Self {
        let ids: Vec<usize> = (0..stripes).collect();
        Self {
            logical_of: ids.clone(),
            physical_of: ids,
        }
    }

    /// Build the map from the logical index of every physical stripe.
    ///
    /// Returns `None` unless `logical_of` is a permutation of `0..len`.
    #[must_use]
    pub fn from_logical(logical_of: Vec<usize>) -> Option<Self> {
        let n = logical_of.len();
        let mut physical_of = vec![usize::MAX; n];
        for (physical, &logical) in logical_of.iter().enumerate() {
            if logical >= n || physical_of[logical] != usize::MAX {
                return None;
            }
            physical_of[logical] = physical;
        }
        Some(Self {
            logical_of,
            physical_of,
        })
    }

    /// # Panics
    /// Panics if `physical` is out of range.
    #[must_use]
    pub fn logical_of(&self, physical: usize) -> usize {
        self.logical_of[physical]
    }

    /// # Panics
    /// Panics if `logical` is out of range.
    #[must_use]
    pub fn physical_of(&self, logical: usize) -> usize {
        self.physical_of[logical]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.logical_of.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.logical_of.is_empty()
    }

    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.logical_of.iter().enumerate().all(|(p, &l)| p == l)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.logical_of.iter().copied().enumerate()
    }
}
