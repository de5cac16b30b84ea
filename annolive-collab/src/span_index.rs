//! Bucketed interval index over committed annotation spans.
//!
//! The character axis is cut into fixed-width buckets. Every span is listed
//! in each bucket it touches, so an overlap query only inspects the buckets
//! covered by the query span instead of every annotation on the document.
//! A separate `bounds` map makes removal O(span length / bucket width).

use rustc_hash::{FxHashMap, FxHashSet};

/// Default bucket width in characters.
pub const DEFAULT_BUCKET_WIDTH: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: u32,
    end: u32,
}

impl Span {
    #[inline(always)]
    fn overlaps(&self, start: u32, end: u32) -> bool {
        self.start < end && start < self.end
    }
}

/// Interval index keyed by annotation id.
#[derive(Debug, Clone)]
pub struct SpanIndex {
    bucket_width: u32,
    buckets: FxHashMap<u32, Vec<String>>,
    bounds: FxHashMap<String, Span>,
}

impl Default for SpanIndex {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKET_WIDTH)
    }
}

impl SpanIndex {
    pub fn new(bucket_width: u32) -> Self {
        Self {
            bucket_width: bucket_width.max(1),
            buckets: FxHashMap::default(),
            bounds: FxHashMap::default(),
        }
    }

    /// Buckets covered by the half-open span `[start, end)`.
    #[inline]
    fn bucket_range(&self, start: u32, end: u32) -> std::ops::RangeInclusive<u32> {
        let last = end.saturating_sub(1).max(start);
        (start / self.bucket_width)..=(last / self.bucket_width)
    }

    /// Insert (or move) a span.
    pub fn insert(&mut self, id: &str, start: u32, end: u32) {
        if self.bounds.contains_key(id) {
            self.remove(id);
        }
        self.bounds.insert(id.to_string(), Span { start, end });
        for bucket in self.bucket_range(start, end) {
            self.buckets.entry(bucket).or_default().push(id.to_string());
        }
    }

    /// Remove a span. Returns false if the id was not indexed.
    pub fn remove(&mut self, id: &str) -> bool {
        let Some(span) = self.bounds.remove(id) else {
            return false;
        };
        for bucket in self.bucket_range(span.start, span.end) {
            if let Some(ids) = self.buckets.get_mut(&bucket) {
                if let Some(pos) = ids.iter().position(|x| x == id) {
                    ids.swap_remove(pos);
                }
                if ids.is_empty() {
                    self.buckets.remove(&bucket);
                }
            }
        }
        true
    }

    /// Ids of every indexed span overlapping `[start, end)`, sorted.
    pub fn overlapping(&self, start: u32, end: u32) -> Vec<String> {
        let mut seen: FxHashSet<&str> = FxHashSet::default();
        for bucket in self.bucket_range(start, end) {
            let Some(ids) = self.buckets.get(&bucket) else {
                continue;
            };
            for id in ids {
                if let Some(span) = self.bounds.get(id) {
                    if span.overlaps(start, end) {
                        seen.insert(id.as_str());
                    }
                }
            }
        }
        let mut out: Vec<String> = seen.into_iter().map(str::to_string).collect();
        out.sort();
        out
    }

    pub fn contains(&self, id: &str) -> bool {
        self.bounds.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.bounds.clear();
    }
}
