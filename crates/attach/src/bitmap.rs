/// Fixed-size bit array indexed by global task id. Sized once at
/// construction; bits only ever go from clear to set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskBitmap {
    words: Vec<u64>,
    len: usize,
}

impl TaskBitmap {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sets bit `idx`, returning true when it was previously clear.
    ///
    /// # Panics
    ///
    /// If `idx` is not below [`len`](Self::len).
    pub fn set(&mut self, idx: usize) -> bool {
        assert!(idx < self.len, "bit {} out of range for {} bits", idx, self.len);
        let (word, mask) = (idx / 64, 1u64 << (idx % 64));
        let was_clear = self.words[word] & mask == 0;
        self.words[word] |= mask;
        was_clear
    }

    /// Out-of-range indices read as clear.
    pub fn test(&self, idx: usize) -> bool {
        idx < self.len && self.words[idx / 64] & (1u64 << (idx % 64)) != 0
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_full(&self) -> bool {
        self.count_ones() == self.len
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |&idx| self.test(idx))
    }

    /// Lowest clear bit at or after `start`, wrapping around once.
    pub fn next_clear_from(&self, start: usize) -> Option<usize> {
        if self.len == 0 {
            return None;
        }
        (0..self.len)
            .map(|offset| (start + offset) % self.len)
            .find(|&idx| !self.test(idx))
    }

    pub fn clear(&mut self, idx: usize) {
        if idx < self.len {
            self.words[idx / 64] &= !(1u64 << (idx % 64));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_reports_first_transition_only() {
        let mut bits = TaskBitmap::new(70);
        assert!(bits.set(65));
        assert!(!bits.set(65));
        assert!(bits.test(65));
        assert!(!bits.test(64));
        assert_eq!(bits.count_ones(), 1);
        assert_eq!(bits.iter_ones().collect::<Vec<_>>(), vec![65]);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn set_past_end_panics() {
        TaskBitmap::new(4).set(4);
    }

    #[test]
    fn clear_scan_wraps_around() {
        let mut bits = TaskBitmap::new(3);
        bits.set(1);
        bits.set(2);
        assert_eq!(bits.next_clear_from(1), Some(0));
        bits.set(0);
        assert_eq!(bits.next_clear_from(0), None);
        bits.clear(2);
        assert_eq!(bits.next_clear_from(0), Some(2));
    }

    #[test]
    fn empty_bitmap_is_full() {
        let bits = TaskBitmap::new(0);
        assert!(bits.is_empty());
        assert!(bits.is_full());
        assert!(!bits.test(0));
    }
}
