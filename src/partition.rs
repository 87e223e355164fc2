
use std::ops::Range;

/// Splits `len` items into `num_slices` contiguous slices of the same size, except for
/// the last non-empty one which may be shorter.
///
/// When there are fewer items than slices, the trailing slices are empty. Slices are
/// expressed as offsets into the items and are disjoint, ordered, and cover every item
/// exactly once.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    len: usize,
    num_slices: usize,
    chunk_size: usize,
}

impl Partition {
    pub fn new(len: usize, num_slices: usize) -> Self {
        let num_slices = num_slices.max(1);
        Partition {
            len,
            num_slices,
            chunk_size: len.div_ceil(num_slices),
        }
    }

    #[inline]
    pub fn num_slices(&self) -> usize { self.num_slices }

    #[inline]
    pub fn chunk_size(&self) -> usize { self.chunk_size }

    /// Total number of items.
    #[inline]
    pub fn len(&self) -> usize { self.len }

    #[inline]
    pub fn is_empty(&self) -> bool { self.len == 0 }

    /// The offsets covered by the slice at `index`.
    pub fn slice(&self, index: usize) -> Range<usize> {
        assert!(index < self.num_slices);

        // chunk_size * index can only overflow for empty trailing slices.
        let start = self.chunk_size.saturating_mul(index).min(self.len);
        let end = start.saturating_add(self.chunk_size).min(self.len);

        start..end
    }

    pub fn slices(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        (0..self.num_slices).map(move |i| self.slice(i))
    }

    /// Number of slices that have at least one item.
    pub fn num_non_empty_slices(&self) -> usize {
        if self.chunk_size == 0 {
            0
        } else {
            self.len.div_ceil(self.chunk_size)
        }
    }
}

#[test]
fn test_remainder_slice() {
    let partition = Partition::new(10, 3);
    assert_eq!(partition.chunk_size(), 4);
    assert_eq!(partition.slices().collect::<Vec<_>>(), vec![0..4, 4..8, 8..10]);
    assert_eq!(partition.num_non_empty_slices(), 3);
}

#[test]
fn test_more_slices_than_items() {
    let partition = Partition::new(2, 8);
    assert_eq!(partition.chunk_size(), 1);
    let slices: Vec<_> = partition.slices().collect();
    assert_eq!(slices.len(), 8);
    assert_eq!(slices[0], 0..1);
    assert_eq!(slices[1], 1..2);
    for slice in &slices[2..] {
        assert!(slice.is_empty());
    }
    assert_eq!(partition.num_non_empty_slices(), 2);
}

#[test]
fn test_empty_partition() {
    let partition = Partition::new(0, 4);
    assert!(partition.is_empty());
    assert_eq!(partition.chunk_size(), 0);
    assert!(partition.slices().all(|slice| slice.is_empty()));
    assert_eq!(partition.num_non_empty_slices(), 0);
}

#[test]
fn test_zero_slices_clamped() {
    let partition = Partition::new(5, 0);
    assert_eq!(partition.num_slices(), 1);
    assert_eq!(partition.slice(0), 0..5);
}

#[test]
fn test_partition_coverage() {
    for len in 0..200 {
        for num_slices in 1..40 {
            let partition = Partition::new(len, num_slices);
            let mut expected_start = 0;
            let mut count = 0;
            for (i, slice) in partition.slices().enumerate() {
                // Contiguous, ordered and disjoint.
                assert_eq!(slice.start, expected_start, "len {} slices {} #{}", len, num_slices, i);
                assert!(slice.end >= slice.start);
                assert!(slice.len() <= partition.chunk_size());
                if slice.end < len {
                    assert_eq!(slice.len(), partition.chunk_size());
                }
                expected_start = slice.end;
                count += slice.len();
            }
            assert_eq!(expected_start, len);
            assert_eq!(count, len);
        }
    }
}

#[test]
fn test_huge_partition() {
    let partition = Partition::new(usize::MAX, 3);
    let slices: Vec<_> = partition.slices().collect();
    assert_eq!(slices[0].start, 0);
    assert_eq!(slices[2].end, usize::MAX);
    assert_eq!(slices[0].end, slices[1].start);
    assert_eq!(slices[1].end, slices[2].start);
}
