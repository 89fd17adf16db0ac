//! The shared waiting-line document.
//!
//! A [`Document`] is the aggregate root of all state: one [`DocumentConfig`],
//! the named [`Line`]s with their queues of [`Person`]s, and the general wait
//! queue. Stores persist it, the reconciler produces new versions of it and
//! the broadcast hub fans [`Snapshot`]s of it out to every connected viewer.

pub mod incoming;

pub use incoming::{IncomingDocument, IncomingLine, IncomingPerson, UpdateRequest};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of a person, stable across reconciliations.
pub type PersonId = i64;

/// Surrogate identifier of a line, stable while the line name is unchanged.
pub type LineId = i64;

pub const DEFAULT_SESSION_DURATION: &str = "30";
pub const DEFAULT_ALARM_INTERVAL: &str = "5";
pub const DEFAULT_MAX_PEOPLE_PER_LINE: &str = "10";
pub const DEFAULT_BLINK_TIME: &str = "5";
pub const DEFAULT_FINISH_WINDOW: &str = "5";
pub const DEFAULT_AUTO_RESCHEDULE: &str = "off";

// ═══════════════════════════════════════════════════════════════════════════════
// Config
// ═══════════════════════════════════════════════════════════════════════════════

/// Board-wide settings. Exactly one exists per document.
///
/// Deserialization is lenient: every field falls back to its default on its
/// own, numbers are accepted where strings are expected and an unusable
/// `maxPeoplePerLine` becomes `"10"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "Value")]
pub struct DocumentConfig {
    pub session_duration: String,
    pub alarm_interval: String,
    pub max_people_per_line: String,
    pub blink_before_start: bool,
    pub blink_time: String,
    pub finish_window: String,
    pub auto_reschedule: String,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            session_duration: DEFAULT_SESSION_DURATION.to_string(),
            alarm_interval: DEFAULT_ALARM_INTERVAL.to_string(),
            max_people_per_line: DEFAULT_MAX_PEOPLE_PER_LINE.to_string(),
            blink_before_start: false,
            blink_time: DEFAULT_BLINK_TIME.to_string(),
            finish_window: DEFAULT_FINISH_WINDOW.to_string(),
            auto_reschedule: DEFAULT_AUTO_RESCHEDULE.to_string(),
        }
    }
}

impl DocumentConfig {
    /// Build a config from an arbitrary JSON value, coercing each field.
    pub fn from_value(value: &Value) -> Self {
        let field = |name: &str| value.as_object().and_then(|obj| obj.get(name));

        Self {
            session_duration: coerce_string(field("sessionDuration"), DEFAULT_SESSION_DURATION),
            alarm_interval: coerce_string(field("alarmInterval"), DEFAULT_ALARM_INTERVAL),
            max_people_per_line: normalize_max_people(&coerce_string(
                field("maxPeoplePerLine"),
                DEFAULT_MAX_PEOPLE_PER_LINE,
            )),
            blink_before_start: coerce_bool(field("blinkBeforeStart"), false),
            blink_time: coerce_string(field("blinkTime"), DEFAULT_BLINK_TIME),
            finish_window: coerce_string(field("finishWindow"), DEFAULT_FINISH_WINDOW),
            auto_reschedule: coerce_string(field("autoReschedule"), DEFAULT_AUTO_RESCHEDULE),
        }
    }

    /// Re-establish the `maxPeoplePerLine` invariant on a config built field by field.
    pub fn normalize(&mut self) {
        self.max_people_per_line = normalize_max_people(&self.max_people_per_line);
    }

    /// The line capacity as a number.
    pub fn max_people(&self) -> u32 {
        self.max_people_per_line.trim().parse().unwrap_or(10)
    }
}

impl From<Value> for DocumentConfig {
    fn from(value: Value) -> Self {
        Self::from_value(&value)
    }
}

fn coerce_string(value: Option<&Value>, default: &str) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => default.to_string(),
    }
}

fn coerce_bool(value: Option<&Value>, default: bool) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) if s.eq_ignore_ascii_case("true") => true,
        Some(Value::String(s)) if s.eq_ignore_ascii_case("false") => false,
        _ => default,
    }
}

/// Canonicalize a line capacity: a positive integer, or the default.
pub fn normalize_max_people(raw: &str) -> String {
    match raw.trim().parse::<u32>() {
        Ok(n) if n > 0 => n.to_string(),
        _ => DEFAULT_MAX_PEOPLE_PER_LINE.to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Lines and People
// ═══════════════════════════════════════════════════════════════════════════════

/// Someone waiting, either in a line or in the general wait queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    pub id: PersonId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A named line. The name is the natural key used for matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Line {
    pub id: LineId,
    pub name: String,
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub people: Vec<Person>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Document
// ═══════════════════════════════════════════════════════════════════════════════

/// The single authoritative document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    #[serde(default)]
    pub config: DocumentConfig,
    #[serde(default)]
    pub lines: Vec<Line>,
    #[serde(default)]
    pub general_wait_queue: Vec<Person>,
}

impl Document {
    /// Look up a line by name.
    pub fn line(&self, name: &str) -> Option<&Line> {
        self.lines.iter().find(|line| line.name == name)
    }

    /// Every person in the document, lines first, then the wait queue.
    pub fn people(&self) -> impl Iterator<Item = &Person> {
        self.lines
            .iter()
            .flat_map(|line| line.people.iter())
            .chain(self.general_wait_queue.iter())
    }

    pub fn person_count(&self) -> usize {
        self.people().count()
    }

    /// Highest person id in use, or 0 for an empty document.
    pub fn max_person_id(&self) -> PersonId {
        self.people().map(|p| p.id).max().unwrap_or(0)
    }

    /// Highest line id in use, or 0 when there are no lines.
    pub fn max_line_id(&self) -> LineId {
        self.lines.iter().map(|line| line.id).max().unwrap_or(0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Snapshot
// ═══════════════════════════════════════════════════════════════════════════════

/// A document tagged with the version it was committed (or read) at.
///
/// This is the wire form returned by `GET /state` and pushed as
/// `state_updated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(flatten)]
    pub document: Document,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(document: Document, version: u64) -> Self {
        Self {
            document,
            version,
            timestamp: Utc::now(),
        }
    }
}
