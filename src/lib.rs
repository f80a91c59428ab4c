// Striped Concurrent Cuckoo Filter
// An approximate set membership data structure that answers "is this item in
// the set?" with either "definitely not" or "maybe, with bounded false
// positive probability", and unlike a Bloom filter supports deletions.
// Readers run optimistically against per-stripe lock versions; writers take
// the stripe's exclusive lock.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use derive_builder::Builder;
use rand::Rng;

mod bits;
mod lock;
mod table;

use crate::table::CuckooTable;

/// Multiplier mixing a fingerprint into its bucket index. The alternate
/// bucket of `(bucket, fingerprint)` is `bucket ^ fingerprint * MIX`, which is
/// its own inverse, so a displaced fingerprint can always find its other home
/// without knowing the original item.
const MIX: i64 = 0x5bd1e995;

/// Upper bound on displacement attempts, regardless of bucket count.
const MAX_KICKS_CEILING: usize = 500;

/// A thread safe cuckoo filter over caller-supplied 64-bit item hashes.
///
/// ## What It Stores
///
/// The filter never sees the items themselves. The caller reduces each item
/// to a 64-bit hash with a well-distributed hash function of its choosing,
/// and the filter derives from that hash a short nonzero *fingerprint*
/// (`bits_per_entry` bits) plus two candidate buckets. A query reports
/// whether either candidate bucket holds the fingerprint, so a `true` answer
/// is probabilistic while `false` is definite.
///
/// ## Cuckoo Displacement
///
/// Each fingerprint has exactly two homes. When both are full, [`put`]
/// evicts a randomly chosen resident entry to its own alternate bucket to
/// make room, which may ripple into a chain of relocations. The chain is
/// bounded by `max_kicks`; if it is exhausted the filter is effectively full
/// and `put` reports failure rather than resizing.
///
/// ## Concurrency Model
///
/// Buckets are guarded by a bank of stripe locks (bucket `b` maps to stripe
/// `b & (stripes - 1)`):
///
/// - **Reads** ([`might_contain`], [`count`]) take an optimistic version
///   stamp, scan without blocking, and only fall back to a shared read lock
///   when a writer invalidated the stamp mid-scan.
/// - **Writes** ([`put`], [`remove`]) take the exclusive write lock of one
///   stripe at a time; no operation ever holds two stripe locks, so there is
///   no lock ordering to get wrong.
///
/// Operations on a single stripe are linearizable. Across stripes a
/// relocation in flight may briefly make a fingerprint visible at neither
/// candidate bucket; once `put` has returned, any `might_contain` that
/// starts afterwards sees the fingerprint at one of the two.
///
/// ## Sizing
///
/// [`CuckooFilter::create`] returns a builder that derives the entry width,
/// bucket count, and stripe count from the expected capacity and the desired
/// false positive probability; see the builder methods for the overrides.
///
/// ```
/// use striped_cuckoo_filter::CuckooFilter;
///
/// let filter = CuckooFilter::create(100).build().unwrap();
/// assert!(filter.put(0xfeed_beef));
/// assert!(filter.might_contain(0xfeed_beef));
/// assert!(filter.remove(0xfeed_beef));
/// assert!(!filter.might_contain(0xfeed_beef));
/// ```
///
/// [`put`]: Self::put
/// [`might_contain`]: Self::might_contain
/// [`count`]: Self::count
/// [`remove`]: Self::remove
#[derive(Builder)]
#[builder(
    pattern = "owned",
    setter(prefix = "with"),
    build_fn(private, name = "base_build", validate = "Self::validate")
)]
pub struct CuckooFilter {
    // Configuration parameters
    /// Expected maximum number of items the filter should hold
    expected_capacity: usize,

    /// Desired false positive probability, between 0 and 1 exclusive
    #[builder(default = "0.002")]
    false_positive_probability: f64,

    /// Fingerprint width in bits (1 to 31); zero means derive it from the
    /// false positive probability
    #[builder(default)]
    bits_per_entry: usize,

    /// Entries per bucket (1, 2, 4, or 8); zero means derive it from the
    /// false positive probability
    #[builder(default)]
    entries_per_bucket: usize,

    /// Number of lock stripes; zero means default to the hardware
    /// parallelism, capped at the bucket count
    #[builder(default)]
    concurrency_level: usize,

    // Internal values derived from the configuration
    /// Number of buckets, always a power of two
    #[builder(setter(skip))]
    buckets: usize,

    /// Maximum number of displacement attempts per insertion
    #[builder(setter(skip))]
    max_kicks: usize,

    /// The bit-packed fingerprint table, replaced with a fully sized one
    /// during `build`
    #[builder(setter(skip), default = "CuckooTable::new(1, 1, 1, 1)")]
    table: CuckooTable,

    /// Number of fingerprints currently stored
    #[builder(setter(skip))]
    items: AtomicUsize,
}

impl CuckooFilter {
    /// Creates a builder for a filter expected to hold up to
    /// `expected_capacity` items.
    pub fn create(expected_capacity: usize) -> CuckooFilterBuilder {
        CuckooFilterBuilder::default().with_expected_capacity(expected_capacity)
    }

    /// Checks whether `item_hash` is in the filter. Returns false if the
    /// item is definitely not present; returns true if it might be, with
    /// false positive probability bounded by the filter configuration.
    pub fn might_contain(&self, item_hash: u64) -> bool {
        let fingerprint = self.fingerprint(item_hash);

        let bucket = self.bucket_of(item_hash);
        if self.table.contains(bucket, fingerprint) {
            return true;
        }

        let alt_bucket = self.alternate_bucket(bucket, fingerprint);
        self.table.contains(alt_bucket, fingerprint)
    }

    /// Puts `item_hash` into the filter. Returns false if both candidate
    /// buckets are full and the displacement chain could not free an entry;
    /// the filter is then at the limit of its configured capacity.
    ///
    /// A failed `put` may still have relocated entries, and the final
    /// evicted fingerprint stays in the table without being counted in
    /// [`items`](Self::items); the displacement chain is not rolled back.
    ///
    /// The same hash can be inserted up to `2 * entries_per_bucket` times
    /// before its two buckets are exhausted.
    pub fn put(&self, item_hash: u64) -> bool {
        let mut fingerprint = self.fingerprint(item_hash);

        let mut bucket = self.bucket_of(item_hash);
        if self.table.add_if_empty(bucket, fingerprint) {
            self.items.fetch_add(1, Ordering::Release);
            return true;
        }

        let alt_bucket = self.alternate_bucket(bucket, fingerprint);
        if self.table.add_if_empty(alt_bucket, fingerprint) {
            self.items.fetch_add(1, Ordering::Release);
            return true;
        }

        // both homes are full; displace residents, starting from a bucket
        // chosen by a fair coin
        let mut rng = rand::rng();
        if rng.random_bool(0.5) {
            bucket = alt_bucket;
        }

        for _ in 0..self.max_kicks {
            let entry = rng.random_range(0..self.entries_per_bucket);
            fingerprint = self.table.get_and_set(bucket, entry, fingerprint);
            bucket = self.alternate_bucket(bucket, fingerprint);
            if self.table.add_if_empty(bucket, fingerprint) {
                self.items.fetch_add(1, Ordering::Release);
                return true;
            }
        }
        false
    }

    /// Removes one occurrence of `item_hash` from the filter. Returns false
    /// if the item is not present.
    ///
    /// Only remove items that were previously inserted: removing an absent
    /// item that collides with a stored fingerprint would evict a different
    /// item.
    pub fn remove(&self, item_hash: u64) -> bool {
        let fingerprint = self.fingerprint(item_hash);

        let bucket = self.bucket_of(item_hash);
        if self.table.remove(bucket, fingerprint) {
            self.decrement_items();
            return true;
        }

        let alt_bucket = self.alternate_bucket(bucket, fingerprint);
        if self.table.remove(alt_bucket, fingerprint) {
            self.decrement_items();
            return true;
        }

        false
    }

    /// Counts how many times `item_hash` is in the filter, i.e. how many
    /// entries of its two candidate buckets hold its fingerprint. The count
    /// is subject to the same false positive probability as
    /// [`might_contain`](Self::might_contain).
    pub fn count(&self, item_hash: u64) -> usize {
        let fingerprint = self.fingerprint(item_hash);

        let bucket = self.bucket_of(item_hash);
        let mut count = self.table.count(bucket, fingerprint);

        let alt_bucket = self.alternate_bucket(bucket, fingerprint);
        if bucket != alt_bucket {
            count += self.table.count(alt_bucket, fingerprint);
        }

        count
    }

    /// Returns the number of fingerprints currently stored.
    pub fn items(&self) -> usize {
        self.items.load(Ordering::Acquire)
    }

    /// Returns true if the filter holds no items.
    pub fn is_empty(&self) -> bool {
        self.items() == 0
    }

    /// Returns the fraction of entry slots currently occupied.
    pub fn load_factor(&self) -> f64 {
        self.items() as f64 / self.capacity() as f64
    }

    /// Returns the total number of entry slots.
    pub fn capacity(&self) -> usize {
        self.buckets * self.entries_per_bucket
    }

    /// Returns the number of buckets.
    pub fn buckets(&self) -> usize {
        self.buckets
    }

    /// Returns the number of entries per bucket.
    pub fn entries_per_bucket(&self) -> usize {
        self.entries_per_bucket
    }

    /// Returns the fingerprint width in bits.
    pub fn bits_per_entry(&self) -> usize {
        self.bits_per_entry
    }

    /// Returns the configured concurrency level.
    pub fn concurrency_level(&self) -> usize {
        self.concurrency_level
    }

    /// Returns the maximum number of displacement attempts per insertion.
    pub fn max_kicks(&self) -> usize {
        self.max_kicks
    }

    /// Derives a nonzero fingerprint from an item hash by scanning
    /// successive `bits_per_entry`-wide windows of the hash, starting with
    /// the topmost bits, and taking the first nonzero window. Falls back to
    /// `1` for the rare hash whose every window is zero, since zero marks an
    /// empty entry.
    fn fingerprint(&self, item_hash: u64) -> u64 {
        let unused_bits = (u64::BITS as usize - self.bits_per_entry) as u32;
        for i in 0..u64::BITS as usize / self.bits_per_entry {
            // shift counts reduce mod 64, so the first window is the topmost
            let window = (self.bits_per_entry * i) as u32;
            let fingerprint = (item_hash << ((u64::BITS - window) & 63)) >> unused_bits;
            if fingerprint != 0 {
                return fingerprint;
            }
        }
        1
    }

    /// Returns the primary bucket of an item hash: the hash bits above the
    /// fingerprint window, folded into the bucket range.
    fn bucket_of(&self, item_hash: u64) -> usize {
        self.bucket_index(item_hash as i64 >> self.bits_per_entry)
    }

    /// Returns the other candidate bucket for a fingerprint currently homed
    /// in `bucket`. Self-inverse: applying it twice with the same
    /// fingerprint yields the original bucket.
    fn alternate_bucket(&self, bucket: usize, fingerprint: u64) -> usize {
        self.bucket_index(bucket as i64 ^ (fingerprint as i64).wrapping_mul(MIX))
    }

    /// Folds a signed 64-bit value into `[0, buckets)`, treating the sign
    /// bit as noise.
    fn bucket_index(&self, bucket_hash: i64) -> usize {
        let hash = if bucket_hash < 0 {
            !bucket_hash
        } else {
            bucket_hash
        };
        hash as usize & (self.buckets - 1)
    }

    /// Saturating decrement: removing a fingerprint that a failed `put` left
    /// behind has no matching increment, and must not wrap the counter.
    fn decrement_items(&self) {
        let _ = self
            .items
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |items| {
                Some(items.saturating_sub(1))
            });
    }
}

impl fmt::Debug for CuckooFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CuckooFilter")
            .field("buckets", &self.buckets)
            .field("entries_per_bucket", &self.entries_per_bucket)
            .field("bits_per_entry", &self.bits_per_entry)
            .field("concurrency_level", &self.concurrency_level)
            .field("max_kicks", &self.max_kicks)
            .field("items", &self.items())
            .finish()
    }
}

impl CuckooFilterBuilder {
    /// Validate the explicitly provided configuration
    fn validate(&self) -> Result<(), String> {
        if let Some(capacity) = self.expected_capacity
            && capacity < 1
        {
            return Err("expected_capacity must be at least 1".into());
        }
        if let Some(fpp) = self.false_positive_probability
            && (fpp <= 0.0 || fpp >= 1.0)
        {
            return Err("false_positive_probability must be between 0 and 1".into());
        }
        if let Some(bits) = self.bits_per_entry
            && !(1..32).contains(&bits)
        {
            return Err("bits_per_entry must be between 1 and 31".into());
        }
        if let Some(entries) = self.entries_per_bucket
            && ![1, 2, 4, 8].contains(&entries)
        {
            return Err("entries_per_bucket must be 1, 2, 4, or 8".into());
        }
        if let Some(level) = self.concurrency_level
            && level < 1
        {
            return Err("concurrency_level must be at least 1".into());
        }
        Ok(())
    }

    /// Builds a [`CuckooFilter`], deriving every configuration value that
    /// was not set explicitly:
    ///
    /// - `entries_per_bucket` from the false positive probability: 8 below
    ///   1e-5, 4 up to 2e-3, 2 otherwise.
    /// - `bits_per_entry` as `ceil((log2(1 / fpp) + 3) / load_factor)`,
    ///   where the target load factor is 0.98, 0.955, or 0.84 for 8, 4, or
    ///   2 entries per bucket.
    /// - The bucket count as the next power of two large enough to hold the
    ///   expected capacity at the target load factor.
    /// - `concurrency_level` as the hardware parallelism, capped at the
    ///   bucket count.
    pub fn build(self) -> Result<CuckooFilter, CuckooFilterBuilderError> {
        let mut filter = self.base_build()?;

        // zero means the value was left to be derived
        if filter.entries_per_bucket == 0 {
            filter.entries_per_bucket =
                derived_entries_per_bucket(filter.false_positive_probability);
        }

        let load_factor = target_load_factor(filter.entries_per_bucket);

        if filter.bits_per_entry == 0 {
            filter.bits_per_entry =
                derived_bits_per_entry(filter.false_positive_probability, load_factor);
        }

        filter.buckets = derived_buckets(
            filter.expected_capacity,
            filter.entries_per_bucket,
            load_factor,
        );

        if filter.concurrency_level == 0 {
            let parallelism = thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1);
            filter.concurrency_level = parallelism.min(filter.buckets);
        }

        filter.max_kicks = filter.buckets.min(MAX_KICKS_CEILING);

        filter.table = CuckooTable::new(
            filter.buckets,
            filter.entries_per_bucket,
            filter.bits_per_entry,
            filter.concurrency_level,
        );

        Ok(filter)
    }
}

fn derived_entries_per_bucket(fpp: f64) -> usize {
    if fpp < 0.00001 {
        8
    } else if fpp <= 0.002 {
        4
    } else {
        2
    }
}

fn target_load_factor(entries_per_bucket: usize) -> f64 {
    match entries_per_bucket {
        8 => 0.98,
        4 => 0.955,
        _ => 0.84,
    }
}

fn derived_bits_per_entry(fpp: f64, load_factor: f64) -> usize {
    (((1.0 / fpp).ln() / std::f64::consts::LN_2 + 3.0) / load_factor).ceil() as usize
}

fn derived_buckets(expected_capacity: usize, entries_per_bucket: usize, load_factor: f64) -> usize {
    let buckets = ((expected_capacity / entries_per_bucket) as f64 / load_factor).ceil() as usize;
    buckets.max(1).next_power_of_two()
}
