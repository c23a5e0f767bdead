//! Ordered, in-memory mapping evidence for one anchor.

use std::collections::{HashMap, HashSet};

use crate::{MappingRecord, MatchType};

#[derive(Debug, Clone)]
struct Entry {
    seq: u32,
    record: MappingRecord,
}

impl Entry {
    fn rank(&self) -> (u32, u8, u32) {
        (self.record.priority, 100 - self.record.confidence.min(100), self.seq)
    }
}

/// Mapping records ordered by (priority, 100 − confidence, insertion order).
#[derive(Debug, Clone, Default)]
pub struct MappingSet {
    entries: Vec<Entry>,
    next_seq: u32,
}

impl MappingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = MappingRecord>) -> Self {
        let mut set = Self::new();
        for record in records {
            set.add(record);
        }
        set
    }

    pub fn add(&mut self, mut record: MappingRecord) {
        record.confidence = record.confidence.min(100);
        let entry = Entry {
            seq: self.next_seq,
            record,
        };
        self.next_seq += 1;
        let at = self
            .entries
            .partition_point(|existing| existing.rank() <= entry.rank());
        self.entries.insert(at, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &MappingRecord> {
        self.entries.iter().map(|e| &e.record)
    }

    pub fn get(&self, index: usize) -> Option<&MappingRecord> {
        self.entries.get(index).map(|e| &e.record)
    }

    pub fn into_records(self) -> Vec<MappingRecord> {
        self.entries.into_iter().map(|e| e.record).collect()
    }

    /// Rendered sort key `PPPP-CCC-NNNN` of the record at `index`.
    pub fn sort_key(&self, index: usize) -> Option<String> {
        self.entries.get(index).map(|e| {
            let (priority, inverse_confidence, seq) = e.rank();
            format!("{priority:04}-{inverse_confidence:03}-{seq:04}")
        })
    }

    pub fn contains(&self, resource: &str, match_type: MatchType) -> bool {
        self.records()
            .any(|r| r.resource == resource && r.match_type == match_type)
    }

    /// Records of one type, keeping only each source's most authoritative priority.
    ///
    /// Marks are kept per source within the requested type only. The first record
    /// of that type seen for a source (records are already sorted) sets the mark;
    /// later records of the same type and source at another priority are dropped.
    /// A resource appears once, at its best-ranked position.
    pub fn filter_by_type(&self, match_type: MatchType) -> Vec<&MappingRecord> {
        let mut marks: HashMap<&str, u32> = HashMap::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut out = Vec::new();
        for record in self.records() {
            if record.match_type != match_type {
                continue;
            }
            let mark = *marks.entry(record.source.as_str()).or_insert(record.priority);
            if mark != record.priority {
                continue;
            }
            if seen.insert(record.resource.as_str()) {
                out.push(record);
            }
        }
        out
    }

    /// Drop every record from `source` with priority ≤ `max_priority`, returning them.
    pub fn remove_by_source(&mut self, source: &str, max_priority: u32) -> Vec<MappingRecord> {
        let (removed, kept): (Vec<Entry>, Vec<Entry>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| e.record.source == source && e.record.priority <= max_priority);
        self.entries = kept;
        removed.into_iter().map(|e| e.record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_PRIORITY;

    fn record(resource: &str, source: &str, match_type: MatchType, confidence: u8, priority: u32) -> MappingRecord {
        MappingRecord::new(resource, match_type, confidence)
            .with_source(source)
            .with_priority(priority)
    }

    #[test]
    fn records_sort_by_priority_then_confidence_then_insertion() {
        let mut set = MappingSet::new();
        set.add(record("r1", "s", MatchType::ExactMatch, 80, DEFAULT_PRIORITY));
        set.add(record("r2", "s", MatchType::ExactMatch, 95, DEFAULT_PRIORITY));
        set.add(record("r3", "t", MatchType::ExactMatch, 10, 5));
        set.add(record("r4", "s", MatchType::ExactMatch, 95, DEFAULT_PRIORITY));
        let order: Vec<&str> = set.records().map(|r| r.resource.as_str()).collect();
        assert_eq!(order, vec!["r3", "r2", "r4", "r1"]);
        assert_eq!(set.sort_key(0).as_deref(), Some("0005-090-0002"));
    }

    #[test]
    fn high_water_mark_keeps_most_authoritative_priority() {
        let mut set = MappingSet::new();
        set.add(record("http://a/1", "curator", MatchType::ExactMatch, 100, 50));
        set.add(record("http://a/2", "curator", MatchType::ExactMatch, 100, 10));
        let exact = set.filter_by_type(MatchType::ExactMatch);
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].priority, 10);
        assert_eq!(exact[0].resource, "http://a/2");
    }

    #[test]
    fn high_water_mark_is_per_source() {
        let mut set = MappingSet::new();
        set.add(record("x", "one", MatchType::ExactMatch, 100, 10));
        set.add(record("y", "two", MatchType::ExactMatch, 100, 50));
        set.add(record("w", "two", MatchType::ExactMatch, 100, 60));
        assert_eq!(set.filter_by_type(MatchType::ExactMatch).len(), 2);
        let exact: Vec<&str> = set
            .filter_by_type(MatchType::ExactMatch)
            .iter()
            .map(|r| r.resource.as_str())
            .collect();
        assert_eq!(exact, vec!["x", "y"]);
    }

    #[test]
    fn high_water_mark_is_kept_per_type() {
        let mut set = MappingSet::new();
        set.add(record("x", "one", MatchType::ExactMatch, 100, 10));
        set.add(record("z", "one", MatchType::CloseMatch, 65, 50));
        set.add(record("v", "one", MatchType::CloseMatch, 65, 70));
        set.add(record("b", "one", MatchType::BroadMatch, 30, 50));

        let close = set.filter_by_type(MatchType::CloseMatch);
        assert_eq!(close.len(), 1);
        assert_eq!(close[0].resource, "z");
        assert_eq!(set.filter_by_type(MatchType::BroadMatch).len(), 1);
        assert_eq!(set.filter_by_type(MatchType::ExactMatch)[0].resource, "x");
    }

    #[test]
    fn filter_deduplicates_resources() {
        let mut set = MappingSet::new();
        set.add(record("x", "one", MatchType::ExactMatch, 90, 50));
        set.add(record("x", "one", MatchType::ExactMatch, 100, 50));
        let exact = set.filter_by_type(MatchType::ExactMatch);
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].confidence, 100);
    }

    #[test]
    fn remove_by_source_respects_priority_ceiling() {
        let mut set = MappingSet::new();
        set.add(record("x", "geo", MatchType::BroadMatch, 40, 50));
        set.add(record("y", "geo", MatchType::BroadMatch, 40, 60));
        set.add(record("z", "other", MatchType::BroadMatch, 40, 50));
        let removed = set.remove_by_source("geo", DEFAULT_PRIORITY);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].resource, "x");
        assert_eq!(set.len(), 2);
    }
}
