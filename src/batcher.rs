use crate::reader::Item;
use std::slice::Chunks;

/// A contiguous run of items sent in one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    items: Vec<Item>,
}

impl Batch {
    /// Creates a batch from consecutive items.
    ///
    /// Returns `None` for an empty slice.
    #[must_use]
    pub fn new(items: Vec<Item>) -> Option<Self> {
        if items.is_empty() {
            None
        } else {
            Some(Self { items })
        }
    }

    /// Items in this batch, in input order.
    #[must_use]
    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// Number of items in this batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Always false; batches are never empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns true if this batch uses the single-item request and response shape.
    #[must_use]
    pub fn is_single(&self) -> bool {
        self.items.len() == 1
    }

    /// Position of the first item; identifies the batch.
    #[must_use]
    pub fn first_position(&self) -> usize {
        self.items.first().map_or(0, |i| i.position)
    }

    /// Position of the last item.
    #[must_use]
    pub fn last_position(&self) -> usize {
        self.items.last().map_or(0, |i| i.position)
    }

    /// Splits the batch in two halves, the first one taking the extra item.
    ///
    /// Returns `None` for a single-item batch.
    #[must_use]
    pub fn halve(&self) -> Option<(Self, Self)> {
        if self.items.len() < 2 {
            return None;
        }

        let mid = self.items.len().div_ceil(2);
        let (left, right) = self.items.split_at(mid);
        Some((
            Self {
                items: left.to_vec(),
            },
            Self {
                items: right.to_vec(),
            },
        ))
    }
}

/// Groups items into fixed-size batches.
///
/// Batch `i` holds items `[i * size, min((i + 1) * size, n))` of the slice
/// it was built from.
pub struct Batcher<'a> {
    chunks: Chunks<'a, Item>,
}

impl<'a> Batcher<'a> {
    /// Creates a batcher over `items`. A zero size is treated as 1.
    #[must_use]
    pub fn new(items: &'a [Item], size: usize) -> Self {
        Self {
            chunks: items.chunks(size.max(1)),
        }
    }

    /// Creates a batcher over the items after `marker`.
    ///
    /// `marker` is the position of the last item already processed.
    #[must_use]
    pub fn resume_after(items: &'a [Item], marker: usize, size: usize) -> Self {
        let start = items
            .iter()
            .position(|i| i.position > marker)
            .unwrap_or(items.len());
        Self::new(&items[start..], size)
    }

    /// Number of batches for `item_count` items of `size` each.
    #[must_use]
    pub const fn batch_count(item_count: usize, size: usize) -> usize {
        let size = if size == 0 { 1 } else { size };
        item_count.div_ceil(size)
    }
}

impl Iterator for Batcher<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        self.chunks.next().map(|chunk| Batch {
            items: chunk.to_vec(),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}
