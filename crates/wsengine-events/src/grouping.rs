//! Ordered greedy bin-packing of a batch into conflict-free groups.

use crate::domain::{EventProfile, profile};
use crate::event::RawEvent;

/// Events (by batch index) that may run concurrently, plus the union of
/// their profiles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventGroup {
    pub indices: Vec<usize>,
    pub profile: EventProfile,
}

impl EventGroup {
    fn new(index: usize, profile: EventProfile) -> Self {
        Self {
            indices: vec![index],
            profile,
        }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Partition profiles into groups. An event is only placed after the last
/// group it conflicts with, so for conflicting `i < j` the group of `i`
/// always precedes the group of `j`.
pub fn group_profiles(profiles: &[EventProfile]) -> Vec<EventGroup> {
    let mut groups: Vec<EventGroup> = Vec::new();
    for (index, profile) in profiles.iter().enumerate() {
        let last_conflict = groups
            .iter()
            .rposition(|group| group.profile.conflicts_with(profile));
        let start = last_conflict.map_or(0, |i| i + 1);

        let slot = groups[start..]
            .iter()
            .position(|group| !group.profile.conflicts_with(profile))
            .map(|offset| start + offset);
        match slot {
            Some(i) => {
                groups[i].indices.push(index);
                groups[i].profile.merge(profile);
            }
            None => groups.push(EventGroup::new(index, *profile)),
        }
    }
    groups
}

pub fn group_events(events: &[RawEvent]) -> Vec<EventGroup> {
    let profiles: Vec<EventProfile> = events.iter().map(|e| profile(&e.event_type)).collect();
    group_profiles(&profiles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use serde_json::json;

    fn events(types: &[EventType]) -> Vec<RawEvent> {
        types
            .iter()
            .map(|t| RawEvent::new(t.clone(), "ws", json!({})))
            .collect()
    }

    fn indices(groups: &[EventGroup]) -> Vec<Vec<usize>> {
        groups.iter().map(|g| g.indices.clone()).collect()
    }

    #[test]
    fn save_splits_resource_events() {
        let groups = group_events(&events(&[
            EventType::ResourceCreated,
            EventType::WorkspaceSave,
            EventType::ResourceUpdated,
        ]));
        assert_eq!(indices(&groups), vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn disjoint_events_share_a_group() {
        let groups = group_events(&events(&[
            EventType::SystemCreated,
            EventType::GithubEntityCreated,
            EventType::WorkflowCreated,
            EventType::JobAgentCreated,
            EventType::PolicySkipDeleted,
        ]));
        assert_eq!(indices(&groups), vec![vec![0, 1, 2, 3, 4]]);
    }

    #[test]
    fn later_event_fills_earlier_gap_after_last_conflict() {
        // workflow.created conflicts with nothing before it, so it joins
        // the first group even though a second group exists.
        let groups = group_events(&events(&[
            EventType::ResourceCreated,
            EventType::ResourceUpdated,
            EventType::WorkflowCreated,
        ]));
        assert_eq!(indices(&groups), vec![vec![0, 2], vec![1]]);
    }

    #[test]
    fn unknown_event_serializes() {
        let groups = group_events(&events(&[
            EventType::SystemCreated,
            EventType::Unknown("mystery.event".into()),
            EventType::WorkflowCreated,
        ]));
        assert_eq!(indices(&groups), vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn empty_batch_has_no_groups() {
        assert!(group_events(&[]).is_empty());
    }
}
