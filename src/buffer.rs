//! Per-cycle result buffer.

use crate::reader::ReadResult;
use std::collections::BTreeMap;

/// Whether a stored result was the first for its index this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// The index had no result yet.
    First,
    /// The index already had a result; it was overwritten.
    Refresh,
}

/// Latest result per index for the cycle in flight.
///
/// Keys are kept ordered so the completed cycle comes out in ascending index
/// order whatever order the results arrived in.
#[derive(Debug, Default, Clone)]
pub struct CycleBuffer {
    results: BTreeMap<usize, ReadResult>,
}

impl CycleBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `result` for `index`, overwriting any earlier one.
    pub fn store(&mut self, index: usize, result: ReadResult) -> Arrival {
        match self.results.insert(index, result) {
            Some(_) => Arrival::Refresh,
            None => Arrival::First,
        }
    }

    /// Whether `index` already has a result.
    pub fn contains(&self, index: usize) -> bool {
        self.results.contains_key(&index)
    }

    /// Drop the result for `index`, if any.
    pub fn discard(&mut self, index: usize) -> Option<ReadResult> {
        self.results.remove(&index)
    }

    /// Indices of `registered` with no result yet, ascending.
    pub fn missing<I>(&self, registered: I) -> Vec<usize>
    where
        I: IntoIterator<Item = usize>,
    {
        registered
            .into_iter()
            .filter(|index| !self.results.contains_key(index))
            .collect()
    }

    /// Smallest index of `registered` with no result yet.
    pub fn next_missing<I>(&self, registered: I) -> Option<usize>
    where
        I: IntoIterator<Item = usize>,
    {
        registered
            .into_iter()
            .filter(|index| !self.results.contains_key(index))
            .min()
    }

    /// Complete iff the buffered key set equals `registered`.
    pub fn is_complete<I>(&self, registered: I) -> bool
    where
        I: IntoIterator<Item = usize>,
    {
        let mut count = 0;
        for index in registered {
            if !self.results.contains_key(&index) {
                return false;
            }
            count += 1;
        }
        count == self.results.len()
    }

    /// Take all results in ascending index order, leaving the buffer empty.
    pub fn take_ordered(&mut self) -> Vec<ReadResult> {
        std::mem::take(&mut self.results).into_values().collect()
    }

    /// Number of buffered results.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.results.clear();
    }
}
