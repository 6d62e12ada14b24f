//! Fixed-size bit vector.
//!
//! Bit `i` is set exactly when resource `i` is in use. The bitmap itself is
//! not synchronized; owners keep it inside a [`Mutex`](crate::sync::Mutex).

const BITS_PER_WORD: usize = u64::BITS as usize;

/// A fixed-size bit vector that keeps count of its set bits.
#[derive(Clone, Debug)]
pub struct BitMap {
    len: usize,
    set: usize,
    words: Vec<u64>,
}

impl BitMap {
    /// Creates a bitmap of `len` clear bits.
    pub fn new(len: usize) -> Self {
        Self {
            len,
            set: 0,
            words: vec![0; len.div_ceil(BITS_PER_WORD)],
        }
    }

    /// Number of bits.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the bitmap has no bits at all.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn locate(&self, index: usize) -> (usize, u64) {
        assert!(index < self.len, "bit {index} out of {}", self.len);
        (index / BITS_PER_WORD, 1 << (index % BITS_PER_WORD))
    }

    /// Sets bit `index`.
    pub fn mark(&mut self, index: usize) {
        let (word, mask) = self.locate(index);
        if self.words[word] & mask == 0 {
            self.words[word] |= mask;
            self.set += 1;
        }
    }

    /// Clears bit `index`.
    pub fn clear(&mut self, index: usize) {
        let (word, mask) = self.locate(index);
        if self.words[word] & mask != 0 {
            self.words[word] &= !mask;
            self.set -= 1;
        }
    }

    /// Whether bit `index` is set.
    pub fn test(&self, index: usize) -> bool {
        let (word, mask) = self.locate(index);
        self.words[word] & mask != 0
    }

    /// Sets the lowest clear bit and returns its index.
    pub fn find(&mut self) -> Option<usize> {
        let index = self
            .words
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)
            .map(|(i, word)| i * BITS_PER_WORD + word.trailing_ones() as usize)
            .filter(|index| *index < self.len)?;
        self.mark(index);
        Some(index)
    }

    /// Iterates over the indices of clear bits in increasing order.
    pub fn iter_clear(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|i| !self.test(*i))
    }

    /// Number of clear bits.
    pub fn num_clear(&self) -> usize {
        self.len - self.set
    }

    /// Number of set bits.
    pub fn num_set(&self) -> usize {
        self.set
    }
}
