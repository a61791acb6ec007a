use std::collections::HashSet;

use crate::model::RawObservation;

type DedupKey = (String, String, String, String, String);

/// Run-scoped collector for extracted observations.
///
/// Owned by exactly one store run. Observations already seen under the same
/// (category, subcategory, name, image, price) key are dropped; accepted ones
/// wait in `pending` until the orchestrator drains them for a page commit.
#[derive(Debug, Default)]
pub struct ObservationSink {
    seen: HashSet<DedupKey>,
    pending: Vec<RawObservation>,
    duplicates: usize,
}

impl ObservationSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the observation was new for this run.
    pub fn offer(&mut self, obs: RawObservation) -> bool {
        if obs.name.trim().is_empty() {
            return false;
        }
        if !self.seen.insert(dedup_key(&obs)) {
            self.duplicates += 1;
            return false;
        }
        self.pending.push(obs);
        true
    }

    pub fn drain(&mut self) -> Vec<RawObservation> {
        std::mem::take(&mut self.pending)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }

    pub fn duplicates(&self) -> usize {
        self.duplicates
    }
}

fn dedup_key(obs: &RawObservation) -> DedupKey {
    (
        obs.category.clone().unwrap_or_default(),
        obs.subcategory.clone().unwrap_or_default(),
        obs.name.clone(),
        obs.image_url.clone().unwrap_or_default(),
        obs.price
            .as_ref()
            .map(|p| p.normalized().to_string())
            .unwrap_or_default(),
    )
}
