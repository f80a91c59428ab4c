use std::sync::atomic::{AtomicU64, Ordering};

const WORD_MASK: u64 = u64::MAX;
const ADDRESS_BITS_PER_WORD: u32 = 6;

/// A fixed length array of bits packed into 64-bit words.
///
/// Exposes three operations over inclusive-start/exclusive-end bit ranges of
/// at most 64 bits: read the range as an unsigned integer, OR a value into the
/// range, and clear the range. Ranges may straddle a word boundary, in which
/// case the low word contributes the low bits of the value and the high word
/// the remaining high bits.
///
/// `PackedBits` performs no synchronization of its own. The words are atomics
/// so a reader racing a writer observes defined (possibly stale) values; it is
/// up to the caller to serialize writers and to validate optimistic reads
/// against a lock version. A range write that straddles two words is two
/// separate word updates and is not atomic as a whole.
pub(crate) struct PackedBits {
    size: u64,
    words: Box<[AtomicU64]>,
}

impl PackedBits {
    /// Creates a bit array of `size` bits, all initially zero.
    pub(crate) fn new(size: u64) -> Self {
        let words = (0..size.div_ceil(u64::BITS as u64))
            .map(|_| AtomicU64::new(0))
            .collect();
        Self { size, words }
    }

    /// Returns the unsigned integer value of bits `[from, to)`, right
    /// justified.
    pub(crate) fn read(&self, from: u64, to: u64) -> u64 {
        self.check_range(from, to);

        let start_word = word_index(from);
        let end_word = word_index(to - 1);

        let first_word_mask = WORD_MASK << (from & 63);
        let last_word_mask = WORD_MASK >> ((64 - (to & 63)) & 63);

        if start_word == end_word {
            (self.words[start_word].load(Ordering::Acquire) & first_word_mask & last_word_mask)
                >> (from & 63)
        } else {
            let low = (self.words[start_word].load(Ordering::Acquire) & first_word_mask)
                >> (from & 63);
            let high = (self.words[end_word].load(Ordering::Acquire) & last_word_mask)
                << ((64 - (from & 63)) & 63);
            low | high
        }
    }

    /// ORs the low `to - from` bits of `value` into bits `[from, to)`.
    pub(crate) fn or(&self, from: u64, to: u64, value: u64) {
        self.check_range(from, to);

        let start_word = word_index(from);
        let end_word = word_index(to - 1);

        let first_word_mask = WORD_MASK << (from & 63);
        let last_word_mask = WORD_MASK >> ((64 - (to & 63)) & 63);

        if start_word == end_word {
            self.words[start_word].fetch_or(
                (value << (from & 63)) & first_word_mask & last_word_mask,
                Ordering::Release,
            );
        } else {
            self.words[start_word]
                .fetch_or((value << (from & 63)) & first_word_mask, Ordering::Release);
            self.words[end_word].fetch_or(
                (value >> ((64 - (from & 63)) & 63)) & last_word_mask,
                Ordering::Release,
            );
        }
    }

    /// Clears bits `[from, to)` to zero.
    pub(crate) fn clear(&self, from: u64, to: u64) {
        self.check_range(from, to);

        let start_word = word_index(from);
        let end_word = word_index(to - 1);

        let first_word_mask = WORD_MASK << (from & 63);
        let last_word_mask = WORD_MASK >> ((64 - (to & 63)) & 63);

        if start_word == end_word {
            self.words[start_word].fetch_and(!(first_word_mask & last_word_mask), Ordering::Release);
        } else {
            self.words[start_word].fetch_and(!first_word_mask, Ordering::Release);
            self.words[end_word].fetch_and(!last_word_mask, Ordering::Release);
        }
    }

    fn check_range(&self, from: u64, to: u64) {
        if from >= self.size {
            panic!(
                "bit index out of bounds: from is not between 0 and {}: {from}",
                self.size
            );
        }
        if to > self.size {
            panic!(
                "bit index out of bounds: to is not between 0 and {}: {to}",
                self.size
            );
        }
        if from > to {
            panic!("bit index out of bounds: from {from} is greater than to {to}");
        }
        if from == to {
            panic!("invalid bit range: from and to cannot both be {from}");
        }
        if to - from > u64::BITS as u64 {
            panic!(
                "invalid bit range: {from}..{to} spans more than {} bits",
                u64::BITS
            );
        }
    }
}

fn word_index(bit_index: u64) -> usize {
    (bit_index >> ADDRESS_BITS_PER_WORD) as usize
}

#[cfg(test)]
mod tests {
    use super::PackedBits;

    #[test]
    #[should_panic(expected = "bit index out of bounds")]
    fn read_rejects_from_past_size() {
        let bits = PackedBits::new(4);
        bits.read(4, 0);
    }

    #[test]
    #[should_panic(expected = "bit index out of bounds")]
    fn read_rejects_to_past_size() {
        let bits = PackedBits::new(4);
        bits.read(0, 5);
    }

    #[test]
    #[should_panic(expected = "invalid bit range")]
    fn read_rejects_empty_range() {
        let bits = PackedBits::new(4);
        bits.read(0, 0);
    }

    #[test]
    #[should_panic(expected = "bit index out of bounds")]
    fn or_rejects_reversed_range() {
        let bits = PackedBits::new(8);
        bits.or(4, 0, 0xff);
    }

    #[test]
    #[should_panic(expected = "bit index out of bounds")]
    fn or_rejects_to_past_size() {
        let bits = PackedBits::new(8);
        bits.or(0, 9, 0xff);
    }

    #[test]
    #[should_panic(expected = "invalid bit range")]
    fn or_rejects_range_wider_than_word() {
        let bits = PackedBits::new(128);
        bits.or(0, 65, 0xff);
    }

    #[test]
    #[should_panic(expected = "bit index out of bounds")]
    fn clear_rejects_to_past_size() {
        let bits = PackedBits::new(16);
        bits.clear(0, 17);
    }

    #[test]
    #[should_panic(expected = "invalid bit range")]
    fn clear_rejects_range_wider_than_word() {
        let bits = PackedBits::new(128);
        bits.clear(32, 128);
    }

    #[test]
    fn or_within_one_word() {
        let bits = PackedBits::new(64);
        bits.or(0, 8, 0xff);
        bits.or(28, 36, 0xff);
        bits.or(56, 64, 0xff);

        assert_eq!(bits.read(0, 8), 0xff);
        assert_eq!(bits.read(8, 28), 0);
        assert_eq!(bits.read(28, 36), 0xff);
        assert_eq!(bits.read(36, 56), 0);
        assert_eq!(bits.read(56, 64), 0xff);

        bits.or(4, 12, 0xff);
        assert_eq!(bits.read(0, 12), 0xfff);
    }

    #[test]
    fn or_across_two_words() {
        let bits = PackedBits::new(128);
        bits.or(60, 68, 0xff);
        assert_eq!(bits.read(0, 60), 0);
        assert_eq!(bits.read(60, 68), 0xff);
        assert_eq!(bits.read(68, 128), 0);
    }

    #[test]
    fn or_truncates_value_to_range_width() {
        let bits = PackedBits::new(64);
        bits.or(8, 12, 0xff);
        assert_eq!(bits.read(8, 12), 0xf);
        assert_eq!(bits.read(12, 16), 0);
    }

    #[test]
    fn read_within_one_word() {
        let bits = PackedBits::new(64);
        bits.or(8, 16, 0xff);
        assert_eq!(bits.read(8, 16), 0xff);
        assert_eq!(bits.read(8, 12), 0xf);
        assert_eq!(bits.read(12, 16), 0xf);
        assert_eq!(bits.read(4, 12), 0xf0);
        assert_eq!(bits.read(0, 16), 0xff00);
    }

    #[test]
    fn read_across_two_words() {
        let bits = PackedBits::new(128);
        bits.or(56, 72, 0xffff);
        assert_eq!(bits.read(56, 72), 0xffff);
        assert_eq!(bits.read(60, 68), 0xff);
    }

    #[test]
    fn read_full_word_range() {
        let bits = PackedBits::new(128);
        bits.or(0, 64, u64::MAX);
        assert_eq!(bits.read(0, 64), u64::MAX);
        assert_eq!(bits.read(64, 128), 0);

        bits.clear(0, 64);
        bits.or(32, 96, u64::MAX);
        assert_eq!(bits.read(32, 96), u64::MAX);
        assert_eq!(bits.read(0, 32), 0);
        assert_eq!(bits.read(96, 128), 0);
    }

    #[test]
    fn clear_within_one_word() {
        let bits = PackedBits::new(64);
        bits.or(0, 8, 0xff);
        bits.clear(0, 8);
        assert_eq!(bits.read(0, 8), 0);

        bits.or(28, 36, 0xff);
        bits.clear(28, 36);
        assert_eq!(bits.read(28, 36), 0);

        bits.or(56, 64, 0xff);
        bits.clear(56, 64);
        assert_eq!(bits.read(56, 64), 0);
    }

    #[test]
    fn clear_across_two_words() {
        let bits = PackedBits::new(128);
        bits.or(56, 64, 0xff);
        bits.clear(56, 64);
        assert_eq!(bits.read(56, 64), 0);

        bits.or(60, 68, 0xff);
        bits.clear(60, 68);
        assert_eq!(bits.read(60, 68), 0);

        bits.or(64, 72, 0xff);
        bits.clear(64, 72);
        assert_eq!(bits.read(64, 72), 0);
    }

    #[test]
    fn clear_leaves_neighboring_bits_alone() {
        let bits = PackedBits::new(128);
        bits.or(48, 80, u64::MAX);
        bits.clear(56, 72);
        assert_eq!(bits.read(48, 56), 0xff);
        assert_eq!(bits.read(56, 72), 0);
        assert_eq!(bits.read(72, 80), 0xff);
    }
}
