//! Per-visit counters.

/// Outcome of one chat visit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VisitStats {
    /// Messages returned by the provider
    pub fetched: usize,
    /// Messages not archived: non-text content, chat senders, or a sender
    /// whose profile could not be fetched
    pub skipped: usize,
    /// Message rows created
    pub inserted: usize,
    /// Messages already stored
    pub existing: usize,
    /// Messages whose upsert failed; picked up again on a later visit
    pub failed: usize,
}

impl VisitStats {
    /// Sum another visit's counters into this one.
    pub fn merge(&mut self, other: VisitStats) {
        self.fetched += other.fetched;
        self.skipped += other.skipped;
        self.inserted += other.inserted;
        self.existing += other.existing;
        self.failed += other.failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_sums_counters() {
        let mut total = VisitStats {
            fetched: 3,
            inserted: 2,
            skipped: 1,
            ..VisitStats::default()
        };
        total.merge(VisitStats {
            fetched: 4,
            existing: 3,
            failed: 1,
            ..VisitStats::default()
        });

        assert_eq!(
            total,
            VisitStats {
                fetched: 7,
                skipped: 1,
                inserted: 2,
                existing: 3,
                failed: 1,
            }
        );
    }
}
