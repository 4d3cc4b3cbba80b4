use std::collections::HashMap;

use permitiq_core::NormalizedPermit;

/// Result of collapsing permit revisions.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupOutcome {
    /// One permit per `permit_number`, in first-seen key order.
    pub permits: Vec<NormalizedPermit>,
    /// Records with no `permit_number`; dropped.
    pub without_key: usize,
    /// Records displaced by, or losing to, another revision of the same key.
    pub superseded: usize,
}

/// Keeps the highest `revision_id` per `permit_number`. A later record only
/// replaces an earlier one when its revision is strictly greater, so ties keep
/// the first seen. A missing revision compares as 0.
pub fn dedupe_latest(permits: impl IntoIterator<Item = NormalizedPermit>) -> DedupOutcome {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut kept: Vec<NormalizedPermit> = Vec::new();
    let mut without_key = 0usize;
    let mut superseded = 0usize;

    for permit in permits {
        let Some(key) = permit.permit_number.clone() else {
            without_key += 1;
            continue;
        };

        match index.get(&key) {
            None => {
                index.insert(key, kept.len());
                kept.push(permit);
            }
            Some(&slot) => {
                superseded += 1;
                if revision(&permit) > revision(&kept[slot]) {
                    kept[slot] = permit;
                }
            }
        }
    }

    DedupOutcome {
        permits: kept,
        without_key,
        superseded,
    }
}

fn revision(permit: &NormalizedPermit) -> i64 {
    permit.revision_id.unwrap_or(0)
}
