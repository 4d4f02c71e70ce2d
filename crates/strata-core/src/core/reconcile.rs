//! Timeline reconciliation.
//!
//! Folds tool events into the text transcript, one kind at a time (graph,
//! then sub-agent, then deep-search). Each kind goes through three stages:
//!
//! 1. persisted and live events are merged by id, live winning;
//! 2. events whose `responseId` names a transcript row are spliced in
//!    directly after that row, in collection order;
//! 3. the remaining events are placed by timestamp.
//!
//! The base transcript is never reordered; rows are only inserted around it.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use super::message::{Message, MessageKind};
use super::tool_events::ToolEvents;

/// Live tool events of every kind, in delivery order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveEvents {
    pub graph: Vec<Message>,
    pub subagent: Vec<Message>,
    pub deep_search: Vec<Message>,
}

impl LiveEvents {
    /// Combines aggregated stream events with explicitly appended ones.
    ///
    /// Explicit deep-search events (post-answer validation) follow the
    /// stream's own calls.
    pub fn new(aggregated: ToolEvents, graph: Vec<Message>, validation: Vec<Message>) -> Self {
        let mut deep_search = aggregated.deep_search;
        deep_search.extend(validation);
        Self {
            graph,
            subagent: aggregated.subagent,
            deep_search,
        }
    }

    pub fn of_kind(&self, kind: MessageKind) -> &[Message] {
        match kind {
            MessageKind::GraphEvent => &self.graph,
            MessageKind::SubagentEvent => &self.subagent,
            MessageKind::DeepsearchEvent => &self.deep_search,
            MessageKind::Text => &[],
        }
    }
}

/// Builds the final transcript from the mapped turns, persisted tool events
/// and live tool events.
pub fn reconcile(base: Vec<Message>, persisted: &[Message], live: &LiveEvents) -> Vec<Message> {
    MessageKind::TOOL_KINDS
        .into_iter()
        .fold(base, |transcript, kind| {
            let persisted_of_kind: Vec<Message> = persisted
                .iter()
                .filter(|message| message.kind == kind)
                .cloned()
                .collect();
            fold_kind(transcript, &persisted_of_kind, live.of_kind(kind))
        })
}

/// Runs the three stages for one tool kind.
pub fn fold_kind(transcript: Vec<Message>, persisted: &[Message], live: &[Message]) -> Vec<Message> {
    let events = merge_persisted(persisted, live);
    let (attached, residual) = attach_by_parent(transcript, events);
    insert_residuals(attached, residual)
}

/// Stage 1: merges by id. Persisted rows seed the order; a live row with
/// the same id replaces the persisted one in place.
pub fn merge_persisted(persisted: &[Message], live: &[Message]) -> Vec<Message> {
    let mut merged: Vec<Message> = Vec::with_capacity(persisted.len() + live.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for message in persisted.iter().chain(live) {
        if let Some(&slot) = index.get(&message.id) {
            merged[slot] = message.clone();
        } else {
            index.insert(message.id.clone(), merged.len());
            merged.push(message.clone());
        }
    }
    merged
}

/// Stage 2: splices each event directly after the row its `responseId`
/// names. Returns the new transcript and the events that matched no row.
pub fn attach_by_parent(
    transcript: Vec<Message>,
    events: Vec<Message>,
) -> (Vec<Message>, Vec<Message>) {
    let known: HashSet<&str> = transcript.iter().map(|m| m.id.as_str()).collect();

    let mut groups: HashMap<String, Vec<Message>> = HashMap::new();
    let mut residual = Vec::new();
    for event in events {
        let parent = event
            .response_id()
            .filter(|id| known.contains(id))
            .map(str::to_string);
        match parent {
            Some(parent) => groups.entry(parent).or_default().push(event),
            None => residual.push(event),
        }
    }

    let attached_count: usize = groups.values().map(Vec::len).sum();
    let mut out = Vec::with_capacity(transcript.len() + attached_count);
    for message in transcript {
        let attached = groups.remove(&message.id);
        out.push(message);
        if let Some(attached) = attached {
            out.extend(attached);
        }
    }
    (out, residual)
}

/// Stage 3: inserts unattached events by timestamp.
///
/// Residuals are sorted ascending (unparseable timestamps last, ties keep
/// collection order) and each goes before the first row whose timestamp is
/// later than its own, or at the end.
pub fn insert_residuals(mut transcript: Vec<Message>, mut residuals: Vec<Message>) -> Vec<Message> {
    residuals.sort_by(|a, b| match (a.timestamp(), b.timestamp()) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });

    for event in residuals {
        let position = event.timestamp().and_then(|ts| {
            transcript
                .iter()
                .position(|existing| existing.timestamp().is_some_and(|other| other > ts))
        });
        match position {
            Some(position) => transcript.insert(position, event),
            None => transcript.push(event),
        }
    }
    transcript
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use chrono::{DateTime, TimeZone, Utc};

    use super::*;
    use crate::core::message::{Role, ToolInput, ToolStatus};

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, minute, 0).unwrap()
    }

    fn text(id: &str, minute: u32) -> Message {
        Message::text(id, Role::Assistant, id, at(minute))
    }

    fn event(kind: MessageKind, call: &str, parent: Option<&str>, minute: u32) -> Message {
        Message::tool_event(
            kind,
            "tool",
            ToolInput::new(parent.map(str::to_string), call),
            ToolStatus::Running,
            at(minute),
        )
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn live_wins_over_persisted_without_duplicates() {
        let persisted = event(MessageKind::DeepsearchEvent, "c1", Some("t1"), 1);
        let mut live = persisted.clone();
        live.tool_status = Some(ToolStatus::Complete);
        live.content = "fresh".to_string();

        let transcript = reconcile(
            vec![text("t1", 0)],
            &[persisted],
            &LiveEvents {
                deep_search: vec![live],
                ..LiveEvents::default()
            },
        );

        assert_eq!(ids(&transcript), ["t1", "deepsearch-c1"]);
        assert_eq!(transcript[1].content, "fresh");
        assert_eq!(transcript[1].tool_status, Some(ToolStatus::Complete));
    }

    #[test]
    fn merge_keeps_persisted_position() {
        let a = event(MessageKind::GraphEvent, "a", None, 1);
        let b = event(MessageKind::GraphEvent, "b", None, 2);
        let c = event(MessageKind::GraphEvent, "c", None, 3);
        let mut b_live = b.clone();
        b_live.content = "live".to_string();

        let merged = merge_persisted(&[a, b], &[c, b_live]);
        assert_eq!(ids(&merged), ["graph-a", "graph-b", "graph-c"]);
        assert_eq!(merged[1].content, "live");
    }

    #[test]
    fn events_attach_after_parent_in_collection_order() {
        let base = vec![text("u1", 0), text("t1", 1), text("u2", 2), text("t2", 3)];
        let live = LiveEvents {
            subagent: vec![
                event(MessageKind::SubagentEvent, "x", Some("t1"), 9),
                event(MessageKind::SubagentEvent, "y", Some("t2"), 9),
                event(MessageKind::SubagentEvent, "z", Some("t1"), 8),
            ],
            ..LiveEvents::default()
        };

        let transcript = reconcile(base, &[], &live);
        assert_eq!(
            ids(&transcript),
            ["u1", "t1", "subagent-x", "subagent-z", "u2", "t2", "subagent-y"]
        );
    }

    #[test]
    fn residual_is_inserted_between_by_timestamp() {
        let base = vec![text("t1", 0), text("t2", 10)];
        let live = LiveEvents {
            graph: vec![event(MessageKind::GraphEvent, "g", Some("missing"), 5)],
            ..LiveEvents::default()
        };

        let transcript = reconcile(base, &[], &live);
        assert_eq!(ids(&transcript), ["t1", "graph-g", "t2"]);
    }

    #[test]
    fn residuals_sort_and_unparseable_goes_last() {
        let base = vec![text("t1", 0), text("t2", 10)];
        let late = event(MessageKind::GraphEvent, "late", None, 30);
        let early = event(MessageKind::GraphEvent, "early", None, 5);
        let mut broken = event(MessageKind::GraphEvent, "broken", None, 0);
        broken.created_at = "not a time".to_string();

        let transcript = insert_residuals(base, vec![broken, late, early]);
        assert_eq!(
            ids(&transcript),
            ["t1", "graph-early", "t2", "graph-late", "graph-broken"]
        );
    }

    #[test]
    fn kinds_chain_and_ids_stay_unique() {
        let base = vec![text("t1", 0)];
        let live = LiveEvents {
            graph: vec![event(MessageKind::GraphEvent, "c1", Some("t1"), 2)],
            subagent: vec![event(MessageKind::SubagentEvent, "c1", Some("t1"), 1)],
            deep_search: vec![event(MessageKind::DeepsearchEvent, "c1", Some("t1"), 1)],
        };
        let persisted = vec![event(MessageKind::GraphEvent, "c1", Some("t1"), 2)];

        let transcript = reconcile(base, &persisted, &live);
        let unique: HashSet<&str> = transcript.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(unique.len(), transcript.len());
        assert_eq!(transcript.len(), 4);
        assert_eq!(transcript[0].id, "t1");
    }

    #[test]
    fn reconcile_is_deterministic() {
        let base = vec![text("t1", 0), text("t2", 10)];
        let live = LiveEvents {
            graph: vec![event(MessageKind::GraphEvent, "g", None, 5)],
            subagent: vec![event(MessageKind::SubagentEvent, "s", Some("t2"), 11)],
            deep_search: vec![event(MessageKind::DeepsearchEvent, "d", Some("t1"), 1)],
        };
        let first = reconcile(base.clone(), &[], &live);
        let second = reconcile(base, &[], &live);
        assert_eq!(first, second);
    }
}
