use crate::bits::PackedBits;
use crate::lock::StampedLock;

/// A thread safe cuckoo hash table over bit-packed fingerprint entries.
///
/// The table partitions a [`PackedBits`] into `buckets` buckets of
/// `entries_per_bucket` entries of `bits_per_entry` bits each. An entry value
/// of zero means the entry is empty. Buckets are guarded by a bank of stripe
/// locks; the stripe for bucket `b` is `b & (stripes - 1)`, so the bank size
/// is rounded up to a power of two and capped at the bucket count. Reads go
/// through an optimistic stamp first and fall back to a shared read lock when
/// validation fails; mutations take the stripe's exclusive write lock. No
/// operation holds more than one stripe lock at a time.
pub(crate) struct CuckooTable {
    entries_per_bucket: usize,
    bits_per_entry: usize,
    stripe_mask: usize,
    stripes: Box<[StampedLock]>,
    // guarded by the stripe locks
    bits: PackedBits,
}

impl CuckooTable {
    pub(crate) fn new(
        buckets: usize,
        entries_per_bucket: usize,
        bits_per_entry: usize,
        concurrency_level: usize,
    ) -> Self {
        assert!(buckets > 0, "buckets must be greater than 0: {buckets}");
        assert!(
            buckets.is_power_of_two(),
            "buckets must be a power of 2: {buckets}"
        );
        assert!(
            entries_per_bucket > 0,
            "entries_per_bucket must be greater than 0: {entries_per_bucket}"
        );
        assert!(
            bits_per_entry > 0,
            "bits_per_entry must be greater than 0: {bits_per_entry}"
        );
        assert!(
            concurrency_level > 0,
            "concurrency_level must be greater than 0: {concurrency_level}"
        );

        let stripe_count = concurrency_level.next_power_of_two().min(buckets);
        let stripes = (0..stripe_count).map(|_| StampedLock::new()).collect();

        let size = buckets as u64 * entries_per_bucket as u64 * bits_per_entry as u64;

        Self {
            entries_per_bucket,
            bits_per_entry,
            stripe_mask: stripe_count - 1,
            stripes,
            bits: PackedBits::new(size),
        }
    }

    /// Returns true if any entry of `bucket` holds `value`.
    pub(crate) fn contains(&self, bucket: usize, value: u64) -> bool {
        let lock = self.stripe(bucket);
        let stamp = lock.optimistic_read();
        let mut contains = self.has_value(bucket, value);

        if !lock.validate(stamp) {
            let _guard = lock.read();
            contains = self.has_value(bucket, value);
        }
        contains
    }

    /// Adds `value` to the first empty entry of `bucket`. Returns false
    /// without mutating if the bucket is full.
    pub(crate) fn add_if_empty(&self, bucket: usize, value: u64) -> bool {
        let _guard = self.stripe(bucket).write();
        for entry in 0..self.entries_per_bucket {
            if self.value_at(bucket, entry) == 0 {
                self.or_value(bucket, entry, value);
                return true;
            }
        }
        false
    }

    /// Replaces the value at `(bucket, entry)` with `value` and returns the
    /// previous value. If the entry already holds `value`, returns it without
    /// mutating.
    pub(crate) fn get_and_set(&self, bucket: usize, entry: usize, value: u64) -> u64 {
        let _guard = self.stripe(bucket).write();
        let existing = self.value_at(bucket, entry);
        if existing == value {
            return existing;
        }
        self.clear_value(bucket, entry);
        self.or_value(bucket, entry, value);
        existing
    }

    /// Clears the first entry of `bucket` equal to `value`. Returns false if
    /// no entry matches.
    pub(crate) fn remove(&self, bucket: usize, value: u64) -> bool {
        let _guard = self.stripe(bucket).write();
        for entry in 0..self.entries_per_bucket {
            if self.value_at(bucket, entry) == value {
                self.clear_value(bucket, entry);
                return true;
            }
        }
        false
    }

    /// Counts the entries of `bucket` equal to `value`.
    pub(crate) fn count(&self, bucket: usize, value: u64) -> usize {
        let lock = self.stripe(bucket);
        let stamp = lock.optimistic_read();
        let mut count = self.matches(bucket, value);

        if !lock.validate(stamp) {
            let _guard = lock.read();
            count = self.matches(bucket, value);
        }
        count
    }

    fn has_value(&self, bucket: usize, value: u64) -> bool {
        (0..self.entries_per_bucket).any(|entry| self.value_at(bucket, entry) == value)
    }

    fn matches(&self, bucket: usize, value: u64) -> usize {
        (0..self.entries_per_bucket)
            .filter(|&entry| self.value_at(bucket, entry) == value)
            .count()
    }

    fn value_at(&self, bucket: usize, entry: usize) -> u64 {
        let start = self.start_bit(bucket, entry);
        self.bits.read(start, start + self.bits_per_entry as u64)
    }

    fn or_value(&self, bucket: usize, entry: usize, value: u64) {
        let start = self.start_bit(bucket, entry);
        self.bits.or(start, start + self.bits_per_entry as u64, value);
    }

    fn clear_value(&self, bucket: usize, entry: usize) {
        let start = self.start_bit(bucket, entry);
        self.bits.clear(start, start + self.bits_per_entry as u64);
    }

    fn start_bit(&self, bucket: usize, entry: usize) -> u64 {
        (bucket as u64 * self.entries_per_bucket as u64 + entry as u64)
            * self.bits_per_entry as u64
    }

    fn stripe(&self, bucket: usize) -> &StampedLock {
        &self.stripes[bucket & self.stripe_mask]
    }
}
