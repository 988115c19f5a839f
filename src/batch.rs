use std::ops::Range;

use tracing::debug;

use crate::parser::ProductRecord;

/// Everything extracted so far plus the watermark of what has been written.
///
/// Deltas are positional: a snapshot's new rows are `snapshot[len..]` where
/// `len` is the number of rows already accumulated. Rows are never matched by
/// id, so a source that reorders or drops earlier rows desynchronizes the
/// delta silently.
#[derive(Debug)]
pub struct Accumulator {
    records: Vec<ProductRecord>,
    flushed: usize,
    batch_size: usize,
}

/// Result of feeding one snapshot to the accumulator.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Ingest {
    pub new_records: usize,
    /// Ranges into `Accumulator::records()` ready to be written, in order.
    pub batches: Vec<Range<usize>>,
}

impl Accumulator {
    pub fn new(batch_size: usize) -> Self {
        Accumulator {
            records: Vec::new(),
            flushed: 0,
            batch_size: batch_size.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn records(&self) -> &[ProductRecord] {
        &self.records
    }

    /// Rows accumulated but not yet handed out as a batch.
    pub fn unflushed(&self) -> usize {
        self.records.len() - self.flushed
    }

    /// How many rows a source showing `count` rows holds beyond what we have.
    pub fn pending_against(&self, count: usize) -> usize {
        count.saturating_sub(self.records.len())
    }

    /// Append the snapshot's new tail and cut batches.
    ///
    /// Full batches of `batch_size` are cut while enough rows are unflushed.
    /// With `force`, a non-empty remainder becomes one last short batch.
    pub fn ingest(&mut self, snapshot: Vec<ProductRecord>, force: bool) -> Ingest {
        let known = self.records.len();
        let new_records = snapshot.len().saturating_sub(known);
        if snapshot.len() < known {
            debug!(
                "Snapshot shorter than accumulated set ({} < {}), nothing new",
                snapshot.len(),
                known
            );
        }
        self.records.extend(snapshot.into_iter().skip(known));

        Ingest {
            new_records,
            batches: self.cut_batches(force),
        }
    }

    fn cut_batches(&mut self, force: bool) -> Vec<Range<usize>> {
        let mut batches = Vec::new();
        while self.unflushed() >= self.batch_size {
            let start = self.flushed;
            self.flushed += self.batch_size;
            batches.push(start..self.flushed);
        }
        if force && self.unflushed() > 0 {
            batches.push(self.flushed..self.records.len());
            self.flushed = self.records.len();
        }
        batches
    }
}

/// Debounce on the total row count: the source has stalled once the count
/// repeats `threshold` polls in a row.
#[derive(Debug, Clone)]
pub struct StallDetector {
    last_count: usize,
    consecutive_same: u32,
    threshold: u32,
}

impl StallDetector {
    pub fn new(threshold: u32) -> Self {
        StallDetector {
            last_count: 0,
            consecutive_same: 0,
            threshold: threshold.max(1),
        }
    }

    /// Record one poll's count. Returns true once stalled.
    pub fn observe(&mut self, count: usize) -> bool {
        if count == self.last_count {
            self.consecutive_same += 1;
        } else {
            self.consecutive_same = 0;
        }
        self.last_count = count;
        self.is_stalled()
    }

    pub fn is_stalled(&self) -> bool {
        self.consecutive_same >= self.threshold
    }

    pub fn last_count(&self) -> usize {
        self.last_count
    }

    pub fn consecutive_same(&self) -> u32 {
        self.consecutive_same
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn rows(n: usize) -> Vec<ProductRecord> {
        let at = Utc::now();
        (0..n)
            .map(|i| {
                let mut r = ProductRecord::empty(at);
                r.id = Some(i as i64);
                r
            })
            .collect()
    }

    fn ids(records: &[ProductRecord]) -> Vec<i64> {
        records.iter().filter_map(|r| r.id).collect()
    }

    #[test]
    fn growing_snapshots_reproduce_last_snapshot() {
        let mut acc = Accumulator::new(7);
        for n in [0, 3, 3, 10, 25, 25, 40] {
            acc.ingest(rows(n), false);
        }
        assert_eq!(acc.len(), 40);
        assert_eq!(ids(acc.records()), (0..40).collect::<Vec<_>>());
    }

    #[test]
    fn same_snapshot_twice_is_counted_once() {
        let mut acc = Accumulator::new(100);
        let first = acc.ingest(rows(30), false);
        let second = acc.ingest(rows(30), false);
        assert_eq!(first.new_records, 30);
        assert_eq!(second.new_records, 0);
        assert_eq!(acc.len(), 30);
        assert!(second.batches.is_empty());
    }

    #[test]
    fn below_threshold_is_accumulated_but_not_flushed() {
        let mut acc = Accumulator::new(100);
        let ingest = acc.ingest(rows(40), false);
        assert_eq!(ingest.new_records, 40);
        assert!(ingest.batches.is_empty());
        assert_eq!(acc.len(), 40);
        assert_eq!(acc.unflushed(), 40);
    }

    #[test]
    fn oversized_delta_is_cut_into_full_batches() {
        let mut acc = Accumulator::new(100);
        assert_eq!(acc.ingest(rows(100), false).batches, vec![0..100]);
        let ingest = acc.ingest(rows(250), false);
        assert_eq!(ingest.new_records, 150);
        assert_eq!(ingest.batches, vec![100..200]);
        assert_eq!(acc.unflushed(), 50);

        let forced = acc.ingest(rows(250), true);
        assert_eq!(forced.new_records, 0);
        assert_eq!(forced.batches, vec![200..250]);
        assert_eq!(acc.unflushed(), 0);
    }

    #[test]
    fn forced_flush_of_nothing_cuts_nothing() {
        let mut acc = Accumulator::new(10);
        acc.ingest(rows(10), false);
        assert!(acc.ingest(rows(10), true).batches.is_empty());
        assert!(acc.ingest(Vec::new(), true).batches.is_empty());
    }

    #[test]
    fn shorter_snapshot_is_a_no_op() {
        let mut acc = Accumulator::new(10);
        acc.ingest(rows(5), false);
        let ingest = acc.ingest(Vec::new(), false);
        assert_eq!(ingest, Ingest::default());
        assert_eq!(acc.len(), 5);
    }

    #[test]
    fn pending_against_count() {
        let mut acc = Accumulator::new(10);
        acc.ingest(rows(5), false);
        assert_eq!(acc.pending_against(12), 7);
        assert_eq!(acc.pending_against(3), 0);
    }

    #[test]
    fn stall_needs_exactly_threshold_repeats() {
        let mut d = StallDetector::new(3);
        assert!(!d.observe(10));
        assert!(!d.observe(10));
        assert!(!d.observe(10));
        assert!(d.observe(10));
        assert_eq!(d.consecutive_same(), 3);
    }

    #[test]
    fn stall_counter_resets_on_growth() {
        let mut d = StallDetector::new(3);
        d.observe(5);
        d.observe(5);
        assert_eq!(d.consecutive_same(), 1);
        d.observe(6);
        assert_eq!(d.consecutive_same(), 0);
        assert_eq!(d.last_count(), 6);
    }

    #[test]
    fn two_identical_counts_do_not_stall() {
        let mut d = StallDetector::new(3);
        d.observe(100);
        assert!(!d.observe(100));
        assert!(!d.observe(100));
        assert!(!d.is_stalled());
    }

    #[test]
    fn empty_page_counts_as_repeat_of_initial_zero() {
        let mut d = StallDetector::new(3);
        assert!(!d.observe(0));
        assert_eq!(d.consecutive_same(), 1);
    }
}
