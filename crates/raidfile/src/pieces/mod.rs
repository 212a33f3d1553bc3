//! Written ranges whose group parity has not been computed yet.


use std::collections::BTreeMap;

/// PendingPieces is a set of disjoint, non-adjacent byte ranges keyed by start offset.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PendingPieces {
    ranges: BTreeMap<u64, u64>,
}

impl PendingPieces {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().map(|(&o, &l)| (o, l))
    }

    /// Whether any pending range intersects `[from, to)`.
    #[must_use]
    pub fn overlaps(&self, from: u64, to: u64) -> bool {
        from < to
            && self
                .ranges
                .range(..to)
                .next_back()
                .is_some_and(|(&o, &l)| o + l > from)
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Add `[offset, offset + length)`, coalescing with overlapping or adjacent
    /// ranges.
    pub fn insert(&mut self, offset: u64, length: u64) {
        if length == 0 {
            return;
        }
        let mut start = offset;
        let mut end = offset + length;

        if let Some((&prev, &prev_len)) = self.ranges.range(..=start).next_back() {
            if prev + prev_len >= start {
                start = prev;
                end = end.max(prev + prev_len);
                self.ranges.remove(&prev);
            }
        }
        let absorbed: Vec<(u64, u64)> = self
            .ranges
            .range(start..=end)
            .map(|(&o, &l)| (o, l))
            .collect();
        for (o, l) in absorbed {
            end = end.max(o + l);
            self.ranges.remove(&o);
        }
        self.ranges.insert(start, end - start);
    }

    /// Drop `[from, to)`, keeping the uncovered parts of partially consumed
    /// ranges.
    pub fn remove_range(&mut self, from: u64, to: u64) {
        if from >= to {
            return;
        }
        let overlapping: Vec<(u64, u64)> = self
            .ranges
            .range(..to)
            .filter(|&(&o, &l)| o + l > from)
            .map(|(&o, &l)| (o, l))
            .collect();
        for (o, l) in overlapping {
            self.ranges.remove(&o);
            let end = o + l;
            if o < from {
                self.ranges.insert(o, from - o);
            }
            if end > to {
                self.ranges.insert(to, end - to);
            }
        }
    }

    /// Take out the offsets of every group of `group_size`
    /// bytes that is fully covered, in ascending order.
    ///
    /// # Panics
    /// Panics if `group_size` is zero.
    pub fn take_complete_groups(&mut self, group_size: u64) -> Vec<u64> {
        assert!(group_size > 0, "group size must be positive");
        let mut groups = Vec::new();
        for (offset, length) in self.iter() {
            let end = offset + length;
            let mut g = offset.div_ceil(group_size) * group_size;
            while g + group_size <= end {
                groups.push(g);
                g += group_size;
            }
        }
        for &g in &groups {
            self.remove_range(g, g + group_size);
        }
        groups
    }

    /// Empty the set, handing back the offsets of every group touched by it,
    /// complete or not, in ascending order.
    ///
    /// # Panics
    /// Panics if `group_size` is zero.
    pub fn take_all_groups(&mut self, group_size: u64) -> Vec<u64> {
        assert!(group_size > 0, "group size must be positive");
        let mut groups: Vec<u64> = Vec::new();
        for (offset, length) in self.iter() {
            let mut g = offset / group_size * group_size;
            while g < offset + length {
                if groups.last() != Some(&g) {
                    groups.push(g);
                }
                g += group_size;
            }
        }
        self.clear();
        groups
    }
}
