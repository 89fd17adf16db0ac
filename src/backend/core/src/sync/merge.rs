//! Diff-and-merge of an incoming document against the stored one.
//!
//! Pure functions only: no I/O, no clock. The reconciler supplies `now`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::document::{
    Document, IncomingDocument, IncomingPerson, Line, LineId, Person, PersonId,
};
use crate::error::{Result, SyncError};

/// What a commit changed. Used for logs, metrics and idempotency checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub config_changed: bool,
    pub lines_created: usize,
    pub lines_updated: usize,
    pub lines_deleted: usize,
    pub people_added: usize,
    pub people_updated: usize,
    pub people_removed: usize,
    /// People dropped because their line was deleted
    pub people_cascaded: usize,
    pub queue_added: usize,
    pub queue_updated: usize,
    pub queue_removed: usize,
}

impl ChangeSet {
    /// Per-kind counts, in a fixed order.
    pub fn counts(&self) -> [(&'static str, usize); 11] {
        [
            ("config_changed", usize::from(self.config_changed)),
            ("lines_created", self.lines_created),
            ("lines_updated", self.lines_updated),
            ("lines_deleted", self.lines_deleted),
            ("people_added", self.people_added),
            ("people_updated", self.people_updated),
            ("people_removed", self.people_removed),
            ("people_cascaded", self.people_cascaded),
            ("queue_added", self.queue_added),
            ("queue_updated", self.queue_updated),
            ("queue_removed", self.queue_removed),
        ]
    }

    /// Number of inserted entities (lines and people).
    pub fn insertions(&self) -> usize {
        self.lines_created + self.people_added + self.queue_added
    }

    /// Number of deleted entities (lines and people).
    pub fn deletions(&self) -> usize {
        self.lines_deleted + self.people_removed + self.people_cascaded + self.queue_removed
    }

    pub fn is_empty(&self) -> bool {
        self.counts().iter().all(|(_, count)| *count == 0)
    }
}

/// Hands out ids for new lines and id-less people, above the highest id seen.
struct IdAllocator {
    last_line: LineId,
    last_person: PersonId,
}

impl IdAllocator {
    fn line(&mut self) -> Result<LineId> {
        self.last_line = next_id(self.last_line, "lines")?;
        Ok(self.last_line)
    }

    fn person(&mut self) -> Result<PersonId> {
        self.last_person = next_id(self.last_person, "people")?;
        Ok(self.last_person)
    }
}

fn next_id(last: i64, field: &'static str) -> Result<i64> {
    last.checked_add(1)
        .ok_or_else(|| SyncError::invalid_field(field, "no ids left to assign"))
}

#[derive(Debug, Default)]
struct PeopleDelta {
    added: usize,
    updated: usize,
    removed: usize,
}

/// Merge `incoming` into `current`, producing the document to persist.
///
/// - Config is taken from the incoming document as given.
/// - Lines match by name; a matched line keeps its id, unmatched stored lines
///   are deleted together with their people.
/// - People match by id within their container. A known id keeps its stored
///   `createdAt` even when it moves between containers.
/// - People without an id get `max(id) + 1` across the whole document.
/// - Repeated ids in one list collapse to one entry: first position, last data.
///
/// Fails only when a new id would not fit in an `i64`.
pub fn reconcile(
    current: &Document,
    incoming: IncomingDocument,
    now: DateTime<Utc>,
) -> Result<(Document, ChangeSet)> {
    let mut changes = ChangeSet {
        config_changed: current.config != incoming.config,
        ..Default::default()
    };

    let stored: HashMap<PersonId, &Person> = current.people().map(|p| (p.id, p)).collect();

    let explicit_ids: HashSet<PersonId> = incoming
        .lines
        .iter()
        .flat_map(|line| line.people.iter())
        .chain(incoming.general_wait_queue.iter())
        .filter_map(|p| p.id)
        .collect();

    let mut ids = IdAllocator {
        last_line: current.max_line_id(),
        last_person: current
            .max_person_id()
            .max(explicit_ids.iter().copied().max().unwrap_or(0)),
    };

    let incoming_names: HashSet<String> =
        incoming.lines.iter().map(|line| line.name.clone()).collect();

    let mut lines = Vec::with_capacity(incoming.lines.len());
    for line in incoming.lines {
        let existing = current.line(&line.name);
        let existing_people = existing.map(|l| l.people.as_slice()).unwrap_or(&[]);

        let (people, delta) = reconcile_people(existing_people, line.people, &stored, &mut ids, now)?;
        changes.people_added += delta.added;
        changes.people_updated += delta.updated;
        changes.people_removed += delta.removed;

        let id = match existing {
            Some(prev) => {
                if prev.time != line.time || prev.people != people {
                    changes.lines_updated += 1;
                }
                prev.id
            }
            None => {
                changes.lines_created += 1;
                ids.line()?
            }
        };

        lines.push(Line {
            id,
            name: line.name,
            time: line.time,
            people,
        });
    }

    for line in current.lines.iter().filter(|l| !incoming_names.contains(&l.name)) {
        changes.lines_deleted += 1;
        changes.people_cascaded += line
            .people
            .iter()
            .filter(|p| !explicit_ids.contains(&p.id))
            .count();
    }

    let (general_wait_queue, delta) = reconcile_people(
        &current.general_wait_queue,
        incoming.general_wait_queue,
        &stored,
        &mut ids,
        now,
    )?;
    changes.queue_added = delta.added;
    changes.queue_updated = delta.updated;
    changes.queue_removed = delta.removed;

    let document = Document {
        config: incoming.config,
        lines,
        general_wait_queue,
    };

    Ok((document, changes))
}

fn reconcile_people(
    existing: &[Person],
    incoming: Vec<IncomingPerson>,
    stored: &HashMap<PersonId, &Person>,
    ids: &mut IdAllocator,
    now: DateTime<Utc>,
) -> Result<(Vec<Person>, PeopleDelta)> {
    let existing_by_id: HashMap<PersonId, &Person> = existing.iter().map(|p| (p.id, p)).collect();
    let mut delta = PeopleDelta::default();
    let mut people = Vec::with_capacity(incoming.len());

    for candidate in dedupe_by_id(incoming) {
        let id = match candidate.id {
            Some(id) => id,
            None => ids.person()?,
        };
        let created_at = stored
            .get(&id)
            .map(|p| p.created_at)
            .or(candidate.created_at)
            .unwrap_or(now);

        let person = Person {
            id,
            name: candidate.name,
            created_at,
        };

        match existing_by_id.get(&id) {
            Some(prev) if **prev == person => {}
            Some(_) => delta.updated += 1,
            None => delta.added += 1,
        }
        people.push(person);
    }

    let kept: HashSet<PersonId> = people.iter().map(|p| p.id).collect();
    delta.removed = existing.iter().filter(|p| !kept.contains(&p.id)).count();

    Ok((people, delta))
}

/// Last write wins for repeated ids, at the position of the first occurrence.
fn dedupe_by_id(people: Vec<IncomingPerson>) -> Vec<IncomingPerson> {
    let mut slots: HashMap<PersonId, usize> = HashMap::new();
    let mut out: Vec<IncomingPerson> = Vec::with_capacity(people.len());

    for person in people {
        match person.id.and_then(|id| slots.get(&id).copied()) {
            Some(slot) => out[slot] = person,
            None => {
                if let Some(id) = person.id {
                    slots.insert(id, out.len());
                }
                out.push(person);
            }
        }
    }

    out
}
