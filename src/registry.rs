//! Ordered source registry.
//!
//! Binds every source to a stable integer index and the reader that serves it.
//! Two maps are kept in step:
//!
//! - index → canonical name, a `BTreeMap` so "first source" and "ascending
//!   order" never depend on hash iteration order
//! - canonical name → [`Source`], which owns the reader
//!
//! # Index policy
//!
//! Indices are caller-assigned keys, not list positions. An insertion is
//! **rejected** when the index is negative or already owned by a different
//! source. Indices at or beyond `len()` are accepted as they are; gaps are
//! allowed and ordering is always by key. Re-inserting a canonical name that
//! is already registered moves it: the previous entry (and its reader) is
//! handed back for disposal, so a name never owns two indices.

use crate::error::{AppResult, MultiReadError};
use crate::reader::{ReaderHandle, ReaderId};
use std::collections::{BTreeMap, HashMap};

/// One registered source.
pub struct Source {
    /// Position key used for all ordering decisions
    pub index: usize,
    /// Name as resolved by the reader
    pub name: String,
    /// Identity of the reader, used to spot deliveries from disposed readers
    pub reader_id: ReaderId,
    reader: Box<dyn ReaderHandle>,
}

impl Source {
    /// Bundle a created reader with its index.
    pub fn new(index: usize, reader_id: ReaderId, reader: Box<dyn ReaderHandle>) -> Self {
        Self {
            index,
            name: reader.resolved_name(),
            reader_id,
            reader,
        }
    }

    /// The reader serving this source.
    pub fn reader(&self) -> &dyn ReaderHandle {
        self.reader.as_ref()
    }

    /// Give up the reader, e.g. for disposal.
    pub fn into_reader(self) -> Box<dyn ReaderHandle> {
        self.reader
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("reader_id", &self.reader_id)
            .finish()
    }
}

/// Outcome of [`SourceRegistry::insert`].
#[derive(Debug)]
pub enum Insertion {
    /// New name at a free index.
    Added,
    /// The name was already registered; its previous entry is returned.
    Replaced(Source),
    /// The index belongs to another source; the unused source is returned.
    Rejected {
        /// Source that was not stored
        source: Source,
        /// Current owner of the index
        owner: String,
    },
}

/// Ordered collection of sources.
#[derive(Default)]
pub struct SourceRegistry {
    by_index: BTreeMap<usize, String>,
    by_name: HashMap<String, Source>,
}

impl SourceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered sources.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Whether no source is registered.
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Check a caller-supplied index before any reader is created.
    pub fn validate_index(index: isize) -> AppResult<usize> {
        usize::try_from(index).map_err(|_| MultiReadError::InvalidIndex {
            index,
            reason: "index must be >= 0".to_string(),
        })
    }

    /// Store `source` at `source.index`.
    pub fn insert(&mut self, source: Source) -> Insertion {
        if let Some(owner) = self.by_index.get(&source.index) {
            if *owner != source.name {
                let owner = owner.clone();
                return Insertion::Rejected { source, owner };
            }
        }

        let previous = self.by_name.remove(&source.name);
        if let Some(prev) = &previous {
            self.by_index.remove(&prev.index);
        }
        self.by_index.insert(source.index, source.name.clone());
        self.by_name.insert(source.name.clone(), source);

        match previous {
            Some(prev) => Insertion::Replaced(prev),
            None => Insertion::Added,
        }
    }

    /// Remove the source with canonical name `name`.
    pub fn remove(&mut self, name: &str) -> Option<Source> {
        let source = self.by_name.remove(name)?;
        self.by_index.remove(&source.index);
        Some(source)
    }

    /// Remove every source, returning their readers in index order.
    pub fn drain(&mut self) -> Vec<Box<dyn ReaderHandle>> {
        let order = std::mem::take(&mut self.by_index);
        let mut by_name = std::mem::take(&mut self.by_name);
        order
            .values()
            .filter_map(|name| by_name.remove(name))
            .map(Source::into_reader)
            .collect()
    }

    /// Canonical names in ascending index order.
    pub fn names(&self) -> Vec<String> {
        self.by_index.values().cloned().collect()
    }

    /// Registered indices, ascending.
    pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.by_index.keys().copied()
    }

    /// Smallest registered index.
    pub fn first_index(&self) -> Option<usize> {
        self.by_index.keys().next().copied()
    }

    /// Source with canonical name `name`.
    pub fn get(&self, name: &str) -> Option<&Source> {
        self.by_name.get(name)
    }

    /// Source at `index`.
    pub fn at(&self, index: usize) -> Option<&Source> {
        self.by_index.get(&index).and_then(|name| self.by_name.get(name))
    }

    /// Sources in ascending index order.
    pub fn iter(&self) -> impl Iterator<Item = &Source> + '_ {
        self.by_index
            .values()
            .filter_map(|name| self.by_name.get(name))
    }

    /// Whether `id` belongs to a reader that is still registered.
    pub fn contains_reader(&self, id: ReaderId) -> bool {
        self.by_name.values().any(|s| s.reader_id == id)
    }

    /// Resolve the name echoed in an update to an index.
    ///
    /// Exact canonical names win. Otherwise both names are compared up to
    /// their first `'('`, so `cmd(1,2)` matches a source registered as `cmd`
    /// or `cmd(3)`; the lowest matching index is returned.
    pub fn match_index(&self, name: &str) -> Option<usize> {
        if let Some(source) = self.by_name.get(name) {
            return Some(source.index);
        }
        let wanted = strip_args(name);
        self.by_index
            .iter()
            .find(|(_, registered)| strip_args(registered) == wanted)
            .map(|(index, _)| *index)
    }
}

fn strip_args(name: &str) -> &str {
    name.split('(').next().unwrap_or(name)
}
