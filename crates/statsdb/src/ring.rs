use crate::{BucketData, FieldKind, Value};

/// Outcome of a windowed write. Failures are silent drops at the store
/// surface; the variants exist so the store can count them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    Ok,
    TypeMismatch,
    OutOfRange,
}

/// A fixed ring of time buckets for one field of one entry.
///
/// Buckets are tagged with their absolute window epoch
/// (`floor(t / window_size)`) and occupy slot `epoch mod num_windows`. A
/// slot whose tag no longer matches the epoch being addressed is recycled
/// in place, so the ring never rotates storage. All arithmetic is in epoch
/// space; the store owns the window_size scaling.
#[derive(Debug, Clone)]
pub(crate) struct WindowRing {
    kind: FieldKind,
    buckets: Vec<Bucket>,
}

#[derive(Debug, Clone)]
struct Bucket {
    /// Absolute window epoch this slot holds, or -1 when never written.
    epoch: i64,
    data: BucketData,
}

impl WindowRing {
    pub fn new(kind: FieldKind, num_windows: usize) -> WindowRing {
        WindowRing {
            kind,
            buckets: (0..num_windows.max(1))
                .map(|_| Bucket {
                    epoch: -1,
                    data: BucketData::new(kind),
                })
                .collect(),
        }
    }

    fn num_windows(&self) -> i64 {
        self.buckets.len() as i64
    }

    /// A bucket expires `window_size * (num_windows - 1)` seconds after it
    /// opens: the oldest ring slot is the recycling slot, so the ring
    /// guarantees the current window plus the preceding `num_windows - 1`.
    fn is_live(&self, epoch: i64, current_epoch: i64) -> bool {
        if epoch < 0 || epoch > current_epoch {
            return false;
        }
        current_epoch - epoch < (self.num_windows() - 1).max(1)
    }

    fn bucket_mut(&mut self, epoch: i64) -> &mut Bucket {
        let idx = epoch.rem_euclid(self.num_windows()) as usize;
        let bucket = &mut self.buckets[idx];
        if bucket.epoch != epoch {
            bucket.data.clear();
            bucket.epoch = epoch;
        }
        bucket
    }

    /// Add `value` into the window `offset` steps before `current_epoch`.
    pub fn add(&mut self, current_epoch: i64, offset: i64, value: &Value) -> WriteOutcome {
        if offset < 0 || offset >= self.num_windows() {
            return WriteOutcome::OutOfRange;
        }
        let target = current_epoch - offset;
        if target < 0 {
            return WriteOutcome::OutOfRange;
        }
        if self.bucket_mut(target).data.add(value) {
            WriteOutcome::Ok
        } else {
            WriteOutcome::TypeMismatch
        }
    }

    /// Subtract from the current window. Only additive fields accept this.
    pub fn sub(&mut self, current_epoch: i64, value: &Value) -> WriteOutcome {
        if self.bucket_mut(current_epoch).data.sub(value) {
            WriteOutcome::Ok
        } else {
            WriteOutcome::TypeMismatch
        }
    }

    /// Aggregate across all live windows.
    pub fn aggregate(&self, current_epoch: i64, aux: Option<&str>) -> Option<i64> {
        let mut acc = BucketData::new(self.kind);
        for b in &self.buckets {
            if self.is_live(b.epoch, current_epoch) {
                acc.merge(&b.data);
            }
        }
        acc.query(aux)
    }

    /// The current window only.
    pub fn current(&self, current_epoch: i64, aux: Option<&str>) -> Option<i64> {
        let idx = current_epoch.rem_euclid(self.num_windows()) as usize;
        let b = &self.buckets[idx];
        if b.epoch == current_epoch {
            b.data.query(aux)
        } else {
            BucketData::new(self.kind).query(aux)
        }
    }

    /// Per-window values, newest first. Stale or never-written windows
    /// contribute zero.
    pub fn windows(&self, current_epoch: i64, aux: Option<&str>) -> Vec<i64> {
        (0..self.num_windows())
            .map(|offset| {
                let epoch = current_epoch - offset;
                let idx = epoch.rem_euclid(self.num_windows()) as usize;
                let b = &self.buckets[idx];
                if b.epoch == epoch && self.is_live(epoch, current_epoch) {
                    b.data.query(aux).unwrap_or(0)
                } else {
                    0
                }
            })
            .collect()
    }

    pub fn reset(&mut self) {
        for b in &mut self.buckets {
            b.epoch = -1;
            b.data.clear();
        }
    }

    /// True when no live window holds data, i.e. the ring reads as empty.
    pub fn is_stale(&self, current_epoch: i64) -> bool {
        self.buckets
            .iter()
            .all(|b| !self.is_live(b.epoch, current_epoch))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // Epochs below assume window_size 10: t=0 -> epoch 0, t=12 -> epoch 1,
    // t=65 -> epoch 6.

    #[test]
    fn sum_across_windows() {
        let mut ring = WindowRing::new(FieldKind::Int, 6);
        assert_eq!(ring.add(0, 0, &Value::Int(3)), WriteOutcome::Ok);
        assert_eq!(ring.add(1, 0, &Value::Int(5)), WriteOutcome::Ok);

        assert_eq!(ring.aggregate(1, None), Some(8));
        assert_eq!(ring.current(1, None), Some(5));

        // Both writes have aged out of the retention horizon.
        assert_eq!(ring.aggregate(6, None), Some(0));
        assert!(ring.is_stale(6));
    }

    #[test]
    fn out_of_range_offsets_drop() {
        let mut ring = WindowRing::new(FieldKind::Int, 4);
        assert_eq!(ring.add(10, 4, &Value::Int(1)), WriteOutcome::OutOfRange);
        assert_eq!(ring.add(10, -1, &Value::Int(1)), WriteOutcome::OutOfRange);
        assert_eq!(ring.add(10, 3, &Value::Int(1)), WriteOutcome::Ok);
        assert_eq!(ring.aggregate(10, None), Some(0)); // oldest slot is the recycling slot
        assert_eq!(ring.add(10, 2, &Value::Int(1)), WriteOutcome::Ok);
        assert_eq!(ring.aggregate(10, None), Some(1));
    }

    #[test]
    fn offset_writes_land_in_prior_windows() {
        let mut ring = WindowRing::new(FieldKind::Int, 6);
        assert_eq!(ring.add(5, 1, &Value::Int(2)), WriteOutcome::Ok);
        assert_eq!(ring.current(5, None), Some(0));
        assert_eq!(ring.current(4, None), Some(2));
        assert_eq!(ring.windows(5, None), vec![0, 2, 0, 0, 0, 0]);
    }

    #[test]
    fn slot_recycling_discards_stale_contents() {
        let mut ring = WindowRing::new(FieldKind::Int, 4);
        ring.add(1, 0, &Value::Int(7));
        // Epoch 5 reuses epoch 1's slot.
        ring.add(5, 0, &Value::Int(1));
        assert_eq!(ring.current(5, None), Some(1));
        assert_eq!(ring.aggregate(5, None), Some(1));
    }

    #[test]
    fn reset_clears_everything() {
        let mut ring = WindowRing::new(FieldKind::Int, 4);
        ring.add(3, 0, &Value::Int(9));
        ring.reset();
        assert_eq!(ring.aggregate(3, None), Some(0));
        assert!(ring.is_stale(3));
    }

    #[test]
    fn single_window_ring_keeps_only_current() {
        let mut ring = WindowRing::new(FieldKind::Int, 1);
        ring.add(2, 0, &Value::Int(4));
        assert_eq!(ring.aggregate(2, None), Some(4));
        assert_eq!(ring.aggregate(3, None), Some(0));
    }
}
