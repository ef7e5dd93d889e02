use crate::utils::align_up;
use std::collections::BTreeMap;

pub const PAGE_SIZE: u64 = 4096;

/// First-fit allocator over the address range `[base, limit)`.
///
/// Used both for GPU virtual address ranges and for carving suballocations out
/// of a base allocation (with `base == 0`).
#[derive(Debug)]
pub struct Aperture {
    base: u64,
    limit: u64,
    align: u64,
    guard_pages: u64,

    // Tracks occupied ranges: Start Address -> Size (guard pages included)
    allocations: BTreeMap<u64, u64>,
}

impl Aperture {
    #[must_use]
    pub const fn new(base: u64, limit: u64, align: u64, guard_pages: u64) -> Self {
        Self {
            base,
            limit,
            align,
            guard_pages,
            allocations: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    /// Reserves `size` bytes aligned to at least `align` and returns the start address.
    pub fn allocate(&mut self, size: u64, align: u64) -> Option<u64> {
        let align = align.max(self.align);
        let guard_size = self.guard_pages * PAGE_SIZE;

        let request_size = size.checked_add(guard_size * 2)?;

        let mut candidate_start = align_up(self.base, align)?;

        for (&alloc_start, &alloc_size) in &self.allocations {
            if alloc_start >= candidate_start && alloc_start - candidate_start >= request_size {
                break;
            }
            candidate_start = candidate_start.max(align_up(alloc_start + alloc_size, align)?);
        }

        let end = candidate_start.checked_add(request_size)?;
        if end > self.limit {
            return None;
        }

        self.allocations.insert(candidate_start, request_size);
        Some(candidate_start + guard_size)
    }

    /// Releases the range starting at `addr`. Returns `false` if it was not tracked.
    pub fn free(&mut self, addr: u64) -> bool {
        addr.checked_sub(self.guard_pages * PAGE_SIZE)
            .is_some_and(|tracked_start| self.allocations.remove(&tracked_start).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fit_packs_and_reuses_holes() {
        let mut ap = Aperture::new(0, 64, 4, 0);
        assert_eq!(ap.allocate(8, 4), Some(0));
        assert_eq!(ap.allocate(4, 4), Some(8));
        assert_eq!(ap.allocate(4, 4), Some(12));

        assert!(ap.free(8));
        assert_eq!(ap.allocate(4, 4), Some(8));
    }

    #[test]
    fn test_alignment_is_honored() {
        let mut ap = Aperture::new(0, 4096, 4, 0);
        assert_eq!(ap.allocate(4, 4), Some(0));
        assert_eq!(ap.allocate(4, 256), Some(256));
    }

    #[test]
    fn test_guard_pages_surround_allocations() {
        let mut ap = Aperture::new(0x10_0000, 0x20_0000, PAGE_SIZE, 1);
        let a = ap.allocate(PAGE_SIZE, PAGE_SIZE).unwrap();
        let b = ap.allocate(PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(a, 0x10_0000 + PAGE_SIZE);
        assert_eq!(b, a + 3 * PAGE_SIZE);
        assert!(ap.free(a));
        assert!(ap.free(b));
        assert!(ap.is_empty());
    }

    #[test]
    fn test_exhaustion_and_untracked_free() {
        let mut ap = Aperture::new(0, 8, 4, 0);
        assert!(ap.allocate(8, 4).is_some());
        assert!(ap.allocate(4, 4).is_none());
        assert!(!ap.free(4));
    }
}
