//! Authoritative ordered catalog of live parts.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::{error::MergeError, part::PartRef};

/// Ordered set of live parts, sorted by `(partition month, left)`.
///
/// Readers take [`PartSet::snapshot`] and keep working on it; writers swap
/// in a new vector under the lock, so every snapshot observes either all of
/// a merge's inputs or its single output, never a mix.
#[derive(Debug, Default)]
pub struct PartSet {
    inner: RwLock<Arc<Vec<PartRef>>>,
}

impl PartSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a set holding `parts`, sorted into canonical order.
    pub fn from_parts(mut parts: Vec<PartRef>) -> Self {
        parts.sort_by_key(|part| part.ordering_key());
        Self {
            inner: RwLock::new(Arc::new(parts)),
        }
    }

    /// Consistent point-in-time view of the set.
    pub fn snapshot(&self) -> Arc<Vec<PartRef>> {
        Arc::clone(&self.inner.read())
    }

    /// Number of live parts.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether the set holds no parts.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Publish a freshly written part at its sorted position.
    pub fn insert(&self, part: PartRef) {
        let mut guard = self.inner.write();
        let mut parts: Vec<PartRef> = guard.as_ref().clone();
        let at = parts.partition_point(|existing| existing.ordering_key() <= part.ordering_key());
        parts.insert(at, part);
        *guard = Arc::new(parts);
    }

    /// Atomically replace a merged run with its output.
    ///
    /// Every input must be present and the inputs must be adjacent in the
    /// set; on success the output sits where the run was and the swap is
    /// visible to subsequent snapshots as a single transition.
    pub fn replace_parts(&self, inputs: &[PartRef], output: PartRef) -> Result<(), MergeError> {
        let mut guard = self.inner.write();
        let mut parts: Vec<PartRef> = guard.as_ref().clone();

        let first = inputs.first().ok_or(MergeError::NoInputs)?;
        let begin = parts
            .iter()
            .position(|part| part.name == first.name)
            .ok_or_else(|| MergeError::MissingPart(first.name.clone()))?;
        for (offset, input) in inputs.iter().enumerate() {
            match parts.get(begin + offset) {
                Some(part) if part.name == input.name => {}
                Some(_) => return Err(MergeError::NonContiguousRun),
                None => return Err(MergeError::MissingPart(input.name.clone())),
            }
        }

        parts.splice(begin..begin + inputs.len(), [output]);
        *guard = Arc::new(parts);
        Ok(())
    }
}
