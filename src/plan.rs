use crate::error::PlanError;

/// Inclusive byte interval `[start, end]` of the remote resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value for the `Range` request header.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// A segment's position in the final file and the bytes it was fetched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHandle {
    pub index: usize,
    pub range: ByteRange,
}

/// Splits `[0, total_size)` into contiguous ranges.
///
/// The first `total_size % segments` ranges carry `total_size / segments + 1`
/// bytes and the rest one byte fewer, so every range is non-empty. When more
/// segments are asked for than there are bytes, the count is clamped to one
/// segment per byte.
///
/// 100 bytes in 10 segments gives 0-9, 10-19, ..., 90-99; 25 bytes in 10
/// gives five 3-byte ranges (0-2 .. 12-14) then five 2-byte ranges ending at 24.
pub fn plan_ranges(total_size: u64, segments: usize) -> Result<Vec<ByteRange>, PlanError> {
    if total_size == 0 {
        return Err(PlanError::EmptyResource);
    }
    if segments == 0 {
        return Err(PlanError::NoSegments);
    }

    let count = (segments as u64).min(total_size);
    let base = total_size / count;
    let remainder = total_size % count;

    let mut ranges = Vec::with_capacity(count as usize);
    let mut offset: u64 = 0;

    for i in 0..count {
        let len = if i < remainder { base + 1 } else { base };
        let start = offset;
        let end = start + len - 1;
        ranges.push(ByteRange { start, end });
        offset = end + 1;
    }

    Ok(ranges)
}

pub fn handles(ranges: &[ByteRange]) -> Vec<SegmentHandle> {
    ranges
        .iter()
        .enumerate()
        .map(|(index, &range)| SegmentHandle { index, range })
        .collect()
}
