//! # Violation Debouncer
//!
//! Turns the raw per-frame detections of a session into one-shot alerts.
//!
//! For every tracked person the debouncer works out which required items of
//! equipment are missing (an item counts as worn when any box with its label
//! overlaps the person by at least the configured IoU threshold). The sorted
//! missing labels are joined into a *missing-key*; an alert fires only when a
//! track's key changes to a new non-empty value. Becoming compliant updates the
//! stored key silently, so a later relapse alerts again.
//!
//! Track state is partitioned per session and swept on every call: entries not
//! seen for longer than the TTL are dropped, and a track that reappears after
//! eviction is treated as first-seen.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;

use super::detection::DetectionBox;
use super::geometry::{iou, Rect};

/// Minimum IoU between a person and an item for the item to count as worn.
pub const DEFAULT_OVERLAP_THRESHOLD: f64 = 0.10;
/// Milliseconds after which an unseen track is forgotten.
pub const DEFAULT_TRACK_TTL_MS: u64 = 10_000;
/// Class index the reference detector uses for people.
pub const DEFAULT_PERSON_CLASS_INDEX: i64 = 3;

/// Tuning for [`ViolationDebouncer`].
#[derive(Debug, Clone, PartialEq)]
pub struct DebounceConfig {
    /// Equipment labels every person must wear.
    pub required_items: Vec<String>,
    /// Label identifying people.
    pub person_label: String,
    /// Class index that also identifies people, regardless of label.
    pub person_class_index: Option<i64>,
    pub overlap_threshold: f64,
    pub track_ttl_ms: u64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            required_items: ["helmet", "vest", "glove", "boots"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            person_label: "person".to_string(),
            person_class_index: Some(DEFAULT_PERSON_CLASS_INDEX),
            overlap_threshold: DEFAULT_OVERLAP_THRESHOLD,
            track_ttl_ms: DEFAULT_TRACK_TTL_MS,
        }
    }
}

impl DebounceConfig {
    fn is_person(&self, b: &DetectionBox) -> bool {
        b.label == self.person_label
            || (self.person_class_index.is_some() && b.class_index == self.person_class_index)
    }
}

/// Last known compliance of one track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackAlertState {
    pub track_id: i64,
    /// Sorted, comma-joined missing labels; empty when compliant.
    pub missing_key: String,
    pub last_seen_at_ms: u64,
}

/// One alert batch for a session: every track whose missing set changed in a
/// single frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert<K> {
    pub session_id: K,
    /// Union of the missing labels, deduplicated in order of first appearance.
    pub missing_items: Vec<String>,
    pub track_ids: Vec<i64>,
}

/// Per-session, per-track alert state machine.
#[derive(Debug)]
pub struct ViolationDebouncer<K> {
    config: DebounceConfig,
    sessions: HashMap<K, HashMap<i64, TrackAlertState>>,
}

impl<K> ViolationDebouncer<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(config: DebounceConfig) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
        }
    }

    pub fn config(&self) -> &DebounceConfig {
        &self.config
    }

    /// Runs one worker result for `session` through the state machine and
    /// returns the alert batch, if any track transitioned to a new missing set.
    pub fn process(&mut self, session: &K, boxes: &[DetectionBox], now_ms: u64) -> Option<Alert<K>> {
        let ttl = self.config.track_ttl_ms;
        let tracks = self.sessions.entry(session.clone()).or_default();
        let before = tracks.len();
        tracks.retain(|_, state| now_ms.saturating_sub(state.last_seen_at_ms) <= ttl);
        if tracks.len() != before {
            log::debug!("Evicted {} stale track(s)", before - tracks.len());
        }

        let items: Vec<(&str, Vec<Rect>)> = self
            .config
            .required_items
            .iter()
            .map(|label| {
                let rects = boxes
                    .iter()
                    .filter(|b| b.label == *label)
                    .map(DetectionBox::rect)
                    .collect();
                (label.as_str(), rects)
            })
            .collect();

        let mut batch: Vec<(i64, Vec<String>)> = Vec::new();
        for person in boxes.iter().filter(|b| self.config.is_person(b)) {
            // Untracked people cannot be debounced.
            let Some(track_id) = person.track_id else {
                continue;
            };
            let body = person.rect();
            let mut missing: Vec<String> = items
                .iter()
                .filter(|(_, rects)| {
                    !rects
                        .iter()
                        .any(|r| iou(&body, r) >= self.config.overlap_threshold)
                })
                .map(|(label, _)| label.to_string())
                .collect();
            missing.sort();
            let key = missing.join(",");

            let fire = match tracks.entry(track_id) {
                Entry::Vacant(slot) => {
                    let fire = !key.is_empty();
                    slot.insert(TrackAlertState {
                        track_id,
                        missing_key: key,
                        last_seen_at_ms: now_ms,
                    });
                    fire
                }
                Entry::Occupied(mut slot) => {
                    let state = slot.get_mut();
                    state.last_seen_at_ms = now_ms;
                    if state.missing_key == key {
                        false
                    } else {
                        let fire = !key.is_empty();
                        state.missing_key = key;
                        fire
                    }
                }
            };
            if fire {
                batch.push((track_id, missing));
            }
        }

        if batch.is_empty() {
            return None;
        }

        let mut missing_items: Vec<String> = Vec::new();
        for item in batch.iter().flat_map(|(_, missing)| missing) {
            if !missing_items.contains(item) {
                missing_items.push(item.clone());
            }
        }
        Some(Alert {
            session_id: session.clone(),
            missing_items,
            track_ids: batch.into_iter().map(|(track_id, _)| track_id).collect(),
        })
    }

    /// Forgets all tracks of a session. Returns how many were dropped.
    pub fn evict_session(&mut self, session: &K) -> usize {
        self.sessions.remove(session).map_or(0, |tracks| tracks.len())
    }

    pub fn track_state(&self, session: &K, track_id: i64) -> Option<&TrackAlertState> {
        self.sessions.get(session)?.get(&track_id)
    }

    pub fn tracked_count(&self, session: &K) -> usize {
        self.sessions.get(session).map_or(0, HashMap::len)
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const S: &str = "1";

    fn person(track: i64) -> DetectionBox {
        DetectionBox::new("person", 0.0, 0.0, 10.0, 10.0).with_track(track)
    }

    fn item(label: &str) -> DetectionBox {
        DetectionBox::new(label, 0.0, 0.0, 10.0, 10.0)
    }

    fn debouncer() -> ViolationDebouncer<String> {
        ViolationDebouncer::new(DebounceConfig::default())
    }

    fn run(d: &mut ViolationDebouncer<String>, boxes: &[DetectionBox], now: u64) -> Option<Alert<String>> {
        d.process(&S.to_string(), boxes, now)
    }

    #[test]
    fn helmet_only_reports_sorted_missing_set() {
        let mut d = debouncer();
        let alert = run(&mut d, &[person(5), item("helmet")], 1_000).expect("first sighting alerts");
        assert_eq!(alert.session_id, S);
        assert_eq!(alert.missing_items, vec!["boots", "glove", "vest"]);
        assert_eq!(alert.track_ids, vec![5]);
        assert_eq!(d.track_state(&S.to_string(), 5).unwrap().missing_key, "boots,glove,vest");
    }

    #[test]
    fn repeated_missing_set_alerts_once() {
        let mut d = debouncer();
        assert!(run(&mut d, &[person(5), item("helmet")], 1_000).is_some());
        assert!(run(&mut d, &[person(5), item("helmet")], 1_100).is_none());
        assert!(run(&mut d, &[person(5), item("helmet")], 1_200).is_none());
    }

    #[test]
    fn changed_missing_set_alerts_again() {
        let mut d = debouncer();
        run(&mut d, &[person(5), item("helmet")], 1_000);
        let alert = run(&mut d, &[person(5), item("helmet"), item("vest")], 1_100)
            .expect("missing set shrank");
        assert_eq!(alert.missing_items, vec!["boots", "glove"]);
        assert_eq!(alert.track_ids, vec![5]);
    }

    #[test]
    fn compliance_is_silent_and_relapse_alerts() {
        let mut d = debouncer();
        let full = [person(9), item("helmet"), item("vest"), item("glove"), item("boots")];

        assert!(run(&mut d, &full, 0).is_none(), "compliant first sighting");
        assert!(run(&mut d, &full, 10).is_none(), "still compliant");
        assert_eq!(d.track_state(&S.to_string(), 9).unwrap().missing_key, "");

        let alert = run(&mut d, &[person(9), item("helmet"), item("vest"), item("glove")], 20)
            .expect("boots came off");
        assert_eq!(alert.missing_items, vec!["boots"]);

        assert!(run(&mut d, &full, 30).is_none(), "back to compliant");
        assert!(run(&mut d, &[person(9), item("helmet"), item("vest"), item("glove")], 40).is_some());
    }

    #[test]
    fn tracks_expire_after_ttl() {
        let mut d = debouncer();
        assert!(run(&mut d, &[person(5)], 0).is_some());

        // Exactly at the TTL the entry survives.
        assert!(run(&mut d, &[], DEFAULT_TRACK_TTL_MS).is_none());
        assert_eq!(d.tracked_count(&S.to_string()), 1);

        // One millisecond later it is gone and the same missing set re-alerts.
        assert!(run(&mut d, &[], DEFAULT_TRACK_TTL_MS + 1).is_none());
        assert_eq!(d.tracked_count(&S.to_string()), 0);
        let alert = run(&mut d, &[person(5)], DEFAULT_TRACK_TTL_MS + 2).expect("first-seen again");
        assert_eq!(alert.missing_items, vec!["boots", "glove", "helmet", "vest"]);
    }

    #[test]
    fn seeing_a_track_refreshes_its_ttl() {
        let mut d = debouncer();
        run(&mut d, &[person(5)], 0);
        run(&mut d, &[person(5)], 8_000);
        assert!(run(&mut d, &[person(5)], 16_000).is_none());
    }

    #[test]
    fn untracked_people_are_ignored() {
        let mut d = debouncer();
        let anonymous = DetectionBox::new("person", 0.0, 0.0, 10.0, 10.0);
        assert!(run(&mut d, &[anonymous], 0).is_none());
        assert_eq!(d.tracked_count(&S.to_string()), 0);
    }

    #[test]
    fn person_class_index_counts_as_person() {
        let mut d = debouncer();
        let worker = DetectionBox::new("3", 0.0, 0.0, 10.0, 10.0).with_class(3).with_track(1);
        let alert = run(&mut d, &[worker], 0).expect("class index 3 is a person");
        assert_eq!(alert.track_ids, vec![1]);
    }

    #[test]
    fn items_below_threshold_do_not_count() {
        let mut d = debouncer();
        // 10x10 person, helmet overlapping a 10x1 strip: IoU exactly 0.1.
        let edge = DetectionBox::new("helmet", 0.0, 0.0, 10.0, 1.0);
        let alert = run(&mut d, &[person(2), edge], 0).unwrap();
        assert!(!alert.missing_items.contains(&"helmet".to_string()));

        let mut d = debouncer();
        let far = DetectionBox::new("helmet", 50.0, 50.0, 60.0, 60.0);
        let alert = run(&mut d, &[person(2), far], 0).unwrap();
        assert!(alert.missing_items.contains(&"helmet".to_string()));
    }

    #[test]
    fn batch_unions_missing_items_in_first_seen_order() {
        let mut d = debouncer();
        let a = person(1);
        let b = DetectionBox::new("person", 100.0, 100.0, 110.0, 110.0).with_track(2);
        let helmet_a = item("helmet");
        let vest_a = item("vest");
        let glove_a = item("glove");
        let boots_b = DetectionBox::new("boots", 100.0, 100.0, 110.0, 110.0);

        let alert = run(&mut d, &[a, b, helmet_a, vest_a, glove_a, boots_b], 0).unwrap();
        assert_eq!(alert.track_ids, vec![1, 2]);
        assert_eq!(alert.missing_items, vec!["boots", "glove", "helmet", "vest"]);
    }

    #[test]
    fn only_changed_tracks_join_the_batch() {
        let mut d = debouncer();
        let b = DetectionBox::new("person", 100.0, 100.0, 110.0, 110.0).with_track(2);
        run(&mut d, &[person(1), item("helmet")], 0);

        let alert = run(&mut d, &[person(1), item("helmet"), b], 10).unwrap();
        assert_eq!(alert.track_ids, vec![2]);
    }

    #[test]
    fn sessions_are_isolated_and_evictable() {
        let mut d = debouncer();
        let one = "1".to_string();
        let two = "2".to_string();
        assert!(d.process(&one, &[person(5)], 0).is_some());
        assert!(d.process(&two, &[person(5)], 0).is_some(), "same track id, other session");

        assert_eq!(d.evict_session(&one), 1);
        assert_eq!(d.tracked_count(&one), 0);
        assert_eq!(d.tracked_count(&two), 1);
        assert!(d.process(&one, &[person(5)], 1).is_some());
    }

    #[test]
    fn custom_required_items() {
        let mut d = ViolationDebouncer::new(DebounceConfig {
            required_items: vec!["mask".to_string()],
            ..DebounceConfig::default()
        });
        let alert = d.process(&"s".to_string(), &[person(4), item("helmet")], 0).unwrap();
        assert_eq!(alert.missing_items, vec!["mask"]);
        assert!(d.process(&"s".to_string(), &[person(4), item("mask")], 1).is_none());
    }
}
