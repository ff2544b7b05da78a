use bitvec::vec::BitVec;

/// First-fit allocator of contiguous index ranges within a fixed capacity.
#[derive(Debug)]
pub struct IdAlloc {
    bits: BitVec,
    capacity: u32,
}

impl IdAlloc {
    pub fn new(capacity: u32) -> Self {
        Self {
            bits: BitVec::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of indices currently allocated.
    pub fn allocated(&self) -> u32 {
        self.bits.count_ones() as u32
    }

    /// Allocates `n` contiguous indices and returns the first one.
    pub fn alloc(&mut self, n: u32) -> Option<u32> {
        assert!(n > 0);
        let mut range_start: u32 = 0;
        let mut len: u32 = 0;
        for i in self.bits.iter_zeros() {
            let i = i as u32;
            if len > 0 && i == range_start + len {
                len += 1;
            } else {
                // Sequence broke, restart at this index.
                range_start = i;
                len = 1;
            }
            if len == n {
                self.bits[range_start as usize..(range_start + n) as usize].fill(true);
                return Some(range_start);
            }
        }

        // A free run touching the end of the bitfield can be extended.
        let end = self.bits.len() as u32;
        let start = if len > 0 && range_start + len == end {
            range_start
        } else {
            end
        };
        if start + n > self.capacity {
            return None;
        }
        self.bits.resize((start + n) as usize, true);
        self.bits[start as usize..(start + n) as usize].fill(true);
        Some(start)
    }

    pub fn free(&mut self, id: u32, n: u32) {
        let slice = &mut self.bits[id as usize..(id + n) as usize];
        debug_assert!(slice.all(), "freeing indices that are not allocated");
        slice.fill(false);
    }

    pub fn is_allocated(&self, id: u32) -> bool {
        self.bits.get(id as usize).is_some_and(|bit| *bit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_reuses_freed_ranges() {
        let mut ids = IdAlloc::new(8);
        assert_eq!(ids.alloc(3), Some(0));
        assert_eq!(ids.alloc(2), Some(3));
        ids.free(0, 3);
        assert_eq!(ids.alloc(1), Some(0));
        assert_eq!(ids.alloc(2), Some(1));
        assert_eq!(ids.allocated(), 5);
    }

    #[test]
    fn test_alloc_extends_trailing_free_run() {
        let mut ids = IdAlloc::new(8);
        assert_eq!(ids.alloc(4), Some(0));
        ids.free(2, 2);
        assert_eq!(ids.alloc(3), Some(2));
        assert!(ids.is_allocated(4));
    }

    #[test]
    fn test_alloc_respects_capacity() {
        let mut ids = IdAlloc::new(4);
        assert_eq!(ids.alloc(3), Some(0));
        assert_eq!(ids.alloc(2), None);
        assert_eq!(ids.alloc(1), Some(3));
        assert_eq!(ids.alloc(1), None);
    }
}
