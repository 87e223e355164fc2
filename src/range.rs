//! Stepped index ranges.

use crate::Error;

use std::fmt::Debug;
use std::ops::Range;

/// Scalar types that can be used as indices of a parallel range.
///
/// Indices are computed as `start + n * step` rather than by repeated addition, which
/// keeps floating point ranges from drifting and lets any offset be reached directly.
pub trait RangeIndex: Copy + PartialOrd + Debug + Send + Sync + 'static {
    /// The step used when none is specified.
    fn unit_step() -> Self;

    /// Whether the step is strictly positive.
    fn is_valid_step(step: Self) -> bool;

    /// The number of indices in `start, start + step, ...` strictly below `end`, or None
    /// if it doesn't fit in a `usize`.
    ///
    /// The step must be valid.
    fn index_count(start: Self, end: Self, step: Self) -> Option<usize>;

    /// The index at offset `n`.
    fn nth(start: Self, step: Self, n: usize) -> Self;
}

macro_rules! impl_int_range_index {
    ($($ty:ty),*) => {
        $(
            impl RangeIndex for $ty {
                #[inline]
                fn unit_step() -> Self { 1 }

                #[inline]
                fn is_valid_step(step: Self) -> bool { step > 0 }

                fn index_count(start: Self, end: Self, step: Self) -> Option<usize> {
                    if start >= end {
                        return Some(0);
                    }

                    // Work in i128 so that spans like i64::MIN..i64::MAX don't overflow.
                    let span = end as i128 - start as i128;
                    let step = step as i128;
                    let count = span / step + if span % step != 0 { 1 } else { 0 };

                    usize::try_from(count).ok()
                }

                #[inline]
                fn nth(start: Self, step: Self, n: usize) -> Self {
                    (start as i128 + n as i128 * step as i128) as $ty
                }
            }
        )*
    }
}

impl_int_range_index!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

macro_rules! impl_float_range_index {
    ($($ty:ty),*) => {
        $(
            impl RangeIndex for $ty {
                #[inline]
                fn unit_step() -> Self { 1.0 }

                // NaN isn't greater than zero.
                #[inline]
                fn is_valid_step(step: Self) -> bool { step > 0.0 }

                fn index_count(start: Self, end: Self, step: Self) -> Option<usize> {
                    // Also catches NaN bounds.
                    if !(start < end) {
                        return Some(0);
                    }

                    let estimate = ((end - start) / step).ceil();
                    if !estimate.is_finite() || estimate >= usize::MAX as $ty {
                        return None;
                    }

                    // Rounding in the division can put the estimate off by one in
                    // either direction.
                    let mut count = estimate as usize;
                    while count > 0 && Self::nth(start, step, count - 1) >= end {
                        count -= 1;
                    }
                    while Self::nth(start, step, count) < end {
                        count += 1;
                    }

                    Some(count)
                }

                #[inline]
                fn nth(start: Self, step: Self, n: usize) -> Self {
                    start + step * n as $ty
                }
            }
        )*
    }
}

impl_float_range_index!(f32, f64);

/// The half-open range `start..end` walked by `step`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct IndexRange<T> {
    start: T,
    end: T,
    step: T,
    len: usize,
}

impl<T: RangeIndex> IndexRange<T> {
    /// Fails if the step isn't strictly positive or if the range holds more than
    /// `usize::MAX` indices.
    pub fn new(start: T, end: T, step: T) -> Result<Self, Error> {
        if !T::is_valid_step(step) {
            return Err(Error::InvalidStep(format!("{:?}", step)));
        }

        let len = T::index_count(start, end, step).ok_or_else(|| {
            Error::RangeTooLarge(format!("{:?}..{:?} by {:?}", start, end, step))
        })?;

        Ok(IndexRange { start, end, step, len })
    }

    pub fn start(&self) -> T { self.start }

    pub fn end(&self) -> T { self.end }

    pub fn step(&self) -> T { self.step }

    /// The number of indices in the range.
    #[inline]
    pub fn len(&self) -> usize { self.len }

    #[inline]
    pub fn is_empty(&self) -> bool { self.len == 0 }

    /// The index at offset `n`, if it is in the range.
    #[inline]
    pub fn get(&self, n: usize) -> Option<T> {
        if n < self.len {
            Some(T::nth(self.start, self.step, n))
        } else {
            None
        }
    }

    /// The indices at the given offsets, in ascending order.
    pub fn indices(&self, offsets: Range<usize>) -> impl Iterator<Item = T> + '_ {
        assert!(offsets.end <= self.len, "{:?} out of 0..{}", offsets, self.len);
        offsets.map(move |n| T::nth(self.start, self.step, n))
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        self.indices(0..self.len)
    }
}

#[test]
fn test_int_ranges() {
    let range = IndexRange::new(0, 10, 1).unwrap();
    assert_eq!(range.len(), 10);
    assert_eq!(range.iter().collect::<Vec<i32>>(), (0..10).collect::<Vec<_>>());

    let range = IndexRange::new(3u8, 20, 5).unwrap();
    assert_eq!(range.iter().collect::<Vec<_>>(), vec![3, 8, 13, 18]);
    assert_eq!(range.get(3), Some(18));
    assert_eq!(range.get(4), None);

    let range = IndexRange::new(-10i64, 10, 7).unwrap();
    assert_eq!(range.iter().collect::<Vec<_>>(), vec![-10, -3, 4]);

    let range = IndexRange::new(5usize, 5, 1).unwrap();
    assert!(range.is_empty());

    let range = IndexRange::new(10i32, 0, 1).unwrap();
    assert!(range.is_empty());
    assert_eq!(range.iter().count(), 0);
}

#[test]
fn test_extreme_int_ranges() {
    let range = IndexRange::new(i64::MIN, i64::MAX, i64::MAX).unwrap();
    assert_eq!(range.len(), 3);
    assert_eq!(range.iter().collect::<Vec<_>>(), vec![i64::MIN, -1, i64::MAX - 1]);

    let range = IndexRange::new(u8::MAX - 1, u8::MAX, 200).unwrap();
    assert_eq!(range.iter().collect::<Vec<_>>(), vec![u8::MAX - 1]);

    let range = IndexRange::new(0u64, u64::MAX, 1 << 32).unwrap();
    assert_eq!(range.len(), 1 << 32);
    assert_eq!(range.get((1 << 32) - 1), Some(u64::MAX - (1 << 32) + 1));
}

#[test]
fn test_float_ranges() {
    let range = IndexRange::new(0.0f64, 1.0, 0.1).unwrap();
    let values: Vec<f64> = range.iter().collect();
    assert_eq!(values.len(), 10);
    assert!(values.iter().all(|v| *v < 1.0));
    assert!((values[9] - 0.9).abs() < 1e-9);

    let range = IndexRange::new(0.0f32, 2.0, 0.5).unwrap();
    assert_eq!(range.iter().collect::<Vec<_>>(), vec![0.0, 0.5, 1.0, 1.5]);

    let range = IndexRange::new(1.0f64, 1.0, 0.5).unwrap();
    assert!(range.is_empty());

    let range = IndexRange::new(f64::NAN, 1.0, 0.5).unwrap();
    assert!(range.is_empty());

    assert!(matches!(
        IndexRange::new(f64::NEG_INFINITY, 0.0, 1.0),
        Err(Error::RangeTooLarge(_))
    ));
}

#[test]
fn test_invalid_steps() {
    assert!(matches!(IndexRange::new(0, 10, 0), Err(Error::InvalidStep(_))));
    assert!(matches!(IndexRange::new(0, 10, -1), Err(Error::InvalidStep(_))));
    assert!(matches!(IndexRange::new(0u32, 10, 0), Err(Error::InvalidStep(_))));
    assert!(matches!(IndexRange::new(0.0, 1.0, 0.0), Err(Error::InvalidStep(_))));
    assert!(matches!(IndexRange::new(0.0, 1.0, -0.5), Err(Error::InvalidStep(_))));
    assert!(matches!(IndexRange::new(0.0, 1.0, f32::NAN), Err(Error::InvalidStep(_))));
    // The step is checked even when the range is empty.
    assert!(matches!(IndexRange::new(10, 0, -1), Err(Error::InvalidStep(_))));
}
