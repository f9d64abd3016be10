//! Arithmetic over half-open byte ranges.
//!
//! Every range in this crate is `[start, end)`. Empty ranges are legal values but never overlap
//! anything and are never produced as gaps.

use std::ops::Range;

use rangemap::RangeSet;

pub type ByteRange = Range<u64>;

/// Whether two ranges share at least one byte.
pub fn overlaps(a: &ByteRange, b: &ByteRange) -> bool {
    !a.is_empty() && !b.is_empty() && a.start < b.end && b.start < a.end
}

/// Returns the sub-ranges of `target` that no range in `occupied` covers, sorted by start.
///
/// `occupied` ranges may overlap each other or stick out of `target`. Zero occupied ranges
/// yield `[target]`, full coverage yields an empty list.
pub fn subtract<'a, I>(target: &ByteRange, occupied: I) -> Vec<ByteRange>
where
    I: IntoIterator<Item = &'a ByteRange>,
{
    if target.is_empty() {
        return Vec::new();
    }

    // `RangeSet` panics on empty ranges.
    let occupied: RangeSet<u64> = occupied
        .into_iter()
        .filter(|r| overlaps(r, target))
        .cloned()
        .collect();

    occupied.gaps(target).collect()
}

/// Splits off the first `chunk_size` bytes of `range` when it is longer than that.
pub fn split_at_chunk(range: ByteRange, chunk_size: u64) -> (ByteRange, Option<ByteRange>) {
    let chunk_size = chunk_size.max(1);

    if range.end - range.start > chunk_size {
        let mid = range.start + chunk_size;
        (range.start..mid, Some(mid..range.end))
    } else {
        (range, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Checks that `gaps` and the clipped `occupied` ranges tile `target` exactly.
    fn assert_tiles(target: &ByteRange, occupied: &[ByteRange], gaps: &[ByteRange]) {
        for pair in gaps.windows(2) {
            assert!(pair[0].end < pair[1].start, "gaps not maximal: {gaps:?}");
        }

        for byte in target.clone() {
            let in_gap = gaps.iter().filter(|g| g.contains(&byte)).count();
            let in_occupied = occupied.iter().any(|o| o.contains(&byte));
            assert_eq!(in_gap, usize::from(!in_occupied), "byte {byte}");
        }

        for gap in gaps {
            assert!(gap.start >= target.start && gap.end <= target.end);
        }
    }

    #[test]
    fn test_overlaps() {
        assert!(overlaps(&(0..10), &(9..20)));
        assert!(!overlaps(&(0..10), &(10..20)));
        assert!(overlaps(&(5..6), &(0..100)));
        assert!(!overlaps(&(5..5), &(0..100)));
    }

    #[test]
    fn test_subtract_nothing_occupied() {
        let nothing: [ByteRange; 0] = [];
        assert_eq!(subtract(&(100..200), &nothing), vec![100..200]);
    }

    #[test]
    fn test_subtract_full_coverage() {
        assert!(subtract(&(100..200), &[100..200]).is_empty());
        assert!(subtract(&(100..200), &[0..150, 150..1000]).is_empty());
    }

    #[test]
    fn test_subtract_contained() {
        assert_eq!(subtract(&(0..100), &[40..60]), vec![0..40, 60..100]);
    }

    #[test]
    fn test_subtract_edges() {
        assert_eq!(subtract(&(0..100), &[50..150]), vec![0..50]);
        assert_eq!(subtract(&(100..200), &[0..150]), vec![150..200]);
    }

    #[test]
    fn test_subtract_unsorted_and_overlapping() {
        let occupied = [70..80, 10..20, 15..30, 90..95];
        let gaps = subtract(&(0..100), &occupied);

        assert_eq!(gaps, vec![0..10, 30..70, 80..90, 95..100]);
        assert_tiles(&(0..100), &occupied, &gaps);
    }

    #[test]
    fn test_subtract_partitions() {
        let target = 0..64;

        // Every way of caching a subset of eight equal pieces.
        for mask in 0u16..256 {
            let occupied: Vec<_> = (0..8)
                .filter(|i| mask & (1u16 << i) != 0)
                .map(|i| i * 8..i * 8 + 8)
                .collect();

            let gaps = subtract(&target, &occupied);
            assert_tiles(&target, &occupied, &gaps);
        }
    }

    #[test]
    fn test_split_at_chunk() {
        assert_eq!(split_at_chunk(0..100, 50), (0..50, Some(50..100)));
        assert_eq!(split_at_chunk(0..50, 50), (0..50, None));
        assert_eq!(split_at_chunk(10..20, 50), (10..20, None));
    }
}
