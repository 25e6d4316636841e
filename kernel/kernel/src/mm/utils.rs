use core::cmp;
use core::fmt;
use core::ops::Range;

use bootinfo::item::{MemoryKind, MemoryRange};

use super::types::PhysFrameNum;

pub const fn align_down(val: usize, align: usize) -> usize {
    (val / align) * align
}

pub const fn align_up(val: usize, align: usize) -> usize {
    align_down(val + align - 1, align)
}

pub fn is_usable(kind: MemoryKind) -> bool {
    kind == MemoryKind::USABLE
}

/// Walks `mem_map`'s usable ranges, with any frames overlapping `reserved_ranges` (assumed sorted
/// by start) carved out, invoking `f` on each remaining sub-range.
pub fn iter_usable_ranges(
    mem_map: &[MemoryRange],
    reserved_ranges: &[Range<PhysFrameNum>],
    mut f: impl FnMut(PhysFrameNum, PhysFrameNum),
) {
    for range in mem_map {
        if !is_usable(range.kind) {
            continue;
        }

        let mut start = PhysFrameNum::new(range.start_page);
        let end = start + range.page_count;

        for reserved in reserved_ranges {
            if start >= end {
                break;
            }
            if reserved.end <= start || reserved.start >= end {
                continue;
            }

            if reserved.start > start {
                f(start, reserved.start);
            }
            start = cmp::max(start, reserved.end);
        }

        if start < end {
            f(start, end);
        }
    }
}

/// Wraps a byte count for human-readable `Display`, choosing the largest whole unit that doesn't
/// lose precision below one decimal place.
pub fn display_byte_size(bytes: usize) -> DisplayByteSize {
    DisplayByteSize(bytes)
}

pub struct DisplayByteSize(usize);

impl fmt::Display for DisplayByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

        let mut value = self.0 as f64;
        let mut unit = 0;
        while value >= 1024.0 && unit < UNITS.len() - 1 {
            value /= 1024.0;
            unit += 1;
        }

        if unit == 0 {
            write!(f, "{} {}", self.0, UNITS[unit])
        } else {
            write!(f, "{:.1} {}", value, UNITS[unit])
        }
    }
}
