//! Side-channel execution trace model.
//!
//! One `TraceInfo` describes one or more recorded executions. Independent
//! capture runs may be merged offline in any grouping, so `add` must be
//! commutative and associative over the set-valued fields.

use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Result, TraceError};

/// Default sidecar file name next to the captured module.
pub const TRACE_INFO_FILE: &str = "traceInfo.json";

/// Function-boundary observations from the capture front end.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FunctionLog {
    /// Function entry addresses in first-seen order.
    pub entries: Vec<u64>,
    /// Entry address to the program counters of blocks that called it.
    pub entry_to_caller: BTreeMap<u64, BTreeSet<u64>>,
    /// Entry address to the program counters execution returned to.
    pub entry_to_return: BTreeMap<u64, BTreeSet<u64>>,
    /// Caller program counter to its unique follow-up program counter.
    pub caller_to_follow_up: BTreeMap<u64, u64>,
    /// Entry address to the member blocks executed under that entry.
    pub entry_to_members: BTreeMap<u64, BTreeSet<u64>>,
}

impl FunctionLog {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
            && self.entry_to_caller.is_empty()
            && self.entry_to_return.is_empty()
            && self.caller_to_follow_up.is_empty()
            && self.entry_to_members.is_empty()
    }

    fn add(&mut self, other: Self) -> Result<()> {
        if self.entries.is_empty() {
            self.entries = other.entries;
        }
        union_relation(&mut self.entry_to_caller, other.entry_to_caller);
        union_relation(&mut self.entry_to_return, other.entry_to_return);
        union_relation(&mut self.entry_to_members, other.entry_to_members);
        for (caller, follow_up) in other.caller_to_follow_up {
            match self.caller_to_follow_up.get(&caller) {
                Some(&existing) if existing != follow_up => {
                    return Err(TraceError::MergeConflict {
                        what: "caller follow-up",
                        key: caller,
                        ours: existing,
                        theirs: follow_up,
                    });
                }
                _ => {
                    self.caller_to_follow_up.insert(caller, follow_up);
                }
            }
        }
        Ok(())
    }
}

fn union_relation(dst: &mut BTreeMap<u64, BTreeSet<u64>>, src: BTreeMap<u64, BTreeSet<u64>>) {
    for (key, values) in src {
        dst.entry(key).or_default().extend(values);
    }
}

/// Immutable record of one or more captured executions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TraceInfo {
    /// Observed `(pc, successor_pc)` edges, deduplicated.
    pub successors: BTreeSet<(u64, u64)>,
    pub function_log: FunctionLog,
    /// Entry address to observed stack-frame size. Scalar: merge asserts
    /// equality on collision.
    pub frame_sizes: BTreeMap<u64, u64>,
}

impl TraceInfo {
    /// Load from a JSON sidecar. A missing file yields an empty trace.
    pub fn load(path: &Path) -> Result<Self> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(TraceError::Io(e)),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    /// Write to a JSON sidecar.
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Merge another record into this one.
    ///
    /// Set-valued fields union; scalar maps assert equality on collision;
    /// the ordered entry list is kept from the first non-empty operand.
    pub fn add(&mut self, other: Self) -> Result<()> {
        self.successors.extend(other.successors);
        self.function_log.add(other.function_log)?;
        for (entry, size) in other.frame_sizes {
            match self.frame_sizes.get(&entry) {
                Some(&existing) if existing != size => {
                    return Err(TraceError::MergeConflict {
                        what: "frame size",
                        key: entry,
                        ours: existing,
                        theirs: size,
                    });
                }
                _ => {
                    self.frame_sizes.insert(entry, size);
                }
            }
        }
        Ok(())
    }

    /// Whether the capture recorded any function-boundary detail.
    pub fn has_function_detail(&self) -> bool {
        !self.function_log.entry_to_members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_a() -> TraceInfo {
        let mut t = TraceInfo::default();
        t.successors.insert((0x1000, 0x1010));
        t.successors.insert((0x1010, 0x1020));
        t.function_log.entries = vec![0x1000, 0x2000];
        t.function_log
            .entry_to_caller
            .entry(0x2000)
            .or_default()
            .insert(0x1008);
        t.function_log.caller_to_follow_up.insert(0x1008, 0x100c);
        t.frame_sizes.insert(0x1000, 16);
        t
    }

    fn sample_b() -> TraceInfo {
        let mut t = TraceInfo::default();
        t.successors.insert((0x1010, 0x1020));
        t.successors.insert((0x2000, 0x2010));
        t.function_log.entries = vec![0x2000];
        t.function_log
            .entry_to_members
            .entry(0x2000)
            .or_default()
            .insert(0x2010);
        t.frame_sizes.insert(0x2000, 32);
        t
    }

    #[test]
    fn test_add_unions_sets() {
        let mut t = sample_a();
        t.add(sample_b()).unwrap();
        assert_eq!(t.successors.len(), 3);
        assert_eq!(
            t.function_log.entry_to_members[&0x2000],
            BTreeSet::from([0x2010])
        );
        assert_eq!(t.frame_sizes[&0x2000], 32);
    }

    #[test]
    fn test_add_commutative_on_set_fields() {
        let mut ab = sample_a();
        ab.add(sample_b()).unwrap();
        let mut ba = sample_b();
        ba.add(sample_a()).unwrap();

        assert_eq!(ab.successors, ba.successors);
        assert_eq!(
            ab.function_log.entry_to_caller,
            ba.function_log.entry_to_caller
        );
        assert_eq!(
            ab.function_log.entry_to_members,
            ba.function_log.entry_to_members
        );
        assert_eq!(ab.frame_sizes, ba.frame_sizes);
    }

    #[test]
    fn test_add_associative() {
        let mut c = TraceInfo::default();
        c.successors.insert((0x3000, 0x3010));

        let mut left = sample_a();
        left.add(sample_b()).unwrap();
        left.add(c.clone()).unwrap();

        let mut bc = sample_b();
        bc.add(c).unwrap();
        let mut right = sample_a();
        right.add(bc).unwrap();

        assert_eq!(left.successors, right.successors);
        assert_eq!(left.function_log, right.function_log);
    }

    #[test]
    fn test_entry_order_from_first_nonempty() {
        let mut empty = TraceInfo::default();
        empty.add(sample_a()).unwrap();
        assert_eq!(empty.function_log.entries, vec![0x1000, 0x2000]);

        let mut a = sample_a();
        a.add(sample_b()).unwrap();
        assert_eq!(a.function_log.entries, vec![0x1000, 0x2000]);
    }

    #[test]
    fn test_scalar_conflict_is_error() {
        let mut a = sample_a();
        let mut b = TraceInfo::default();
        b.frame_sizes.insert(0x1000, 24);
        assert!(matches!(
            a.add(b),
            Err(TraceError::MergeConflict { key: 0x1000, .. })
        ));
    }

    #[test]
    fn test_follow_up_conflict_is_error() {
        let mut a = sample_a();
        let mut b = TraceInfo::default();
        b.function_log.caller_to_follow_up.insert(0x1008, 0xdead);
        assert!(matches!(
            a.add(b),
            Err(TraceError::MergeConflict {
                what: "caller follow-up",
                ..
            })
        ));
    }

    #[test]
    fn test_load_missing_is_empty() {
        let t = TraceInfo::load(Path::new("/nonexistent/traceInfo.json")).unwrap();
        assert_eq!(t, TraceInfo::default());
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(TRACE_INFO_FILE);
        let t = sample_a();
        t.save(&path).unwrap();
        let back = TraceInfo::load(&path).unwrap();
        assert_eq!(t, back);
    }
}
