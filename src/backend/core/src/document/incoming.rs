//! Parsing of client-supplied documents.
//!
//! Clients send documents as loosely shaped JSON. Everything is checked and
//! coerced here, before the reconciler sees it, so that reconciliation only
//! ever deals with well-formed input.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

use super::{DocumentConfig, PersonId};
use crate::error::{Result, SyncError};

/// A person as sent by a client. Missing ids are assigned by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingPerson {
    pub id: Option<PersonId>,
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// A line as sent by a client, identified by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingLine {
    pub name: String,
    pub time: String,
    pub people: Vec<IncomingPerson>,
}

/// A validated full document from a client.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IncomingDocument {
    pub config: DocumentConfig,
    pub lines: Vec<IncomingLine>,
    pub general_wait_queue: Vec<IncomingPerson>,
}

/// An update: the document plus the version the client last saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRequest {
    pub document: IncomingDocument,
    pub claimed_version: Option<u64>,
}

impl UpdateRequest {
    /// Parse a request body.
    ///
    /// Accepts either `{"state": <document>, "version": n}` or a bare
    /// document, optionally carrying a top-level `version`.
    pub fn from_json(value: Value) -> Result<Self> {
        let Value::Object(mut body) = value else {
            return Err(SyncError::validation("Payload must be a JSON object"));
        };

        let claimed_version = parse_version(body.remove("version"))?;

        let document = match body.remove("state") {
            Some(state) => IncomingDocument::from_json(state)?,
            None => IncomingDocument::from_object(body)?,
        };

        Ok(Self {
            document,
            claimed_version,
        })
    }

    /// Build a request from a `state_saved` event. The version is parsed
    /// exactly like a REST body's.
    pub fn from_event(state: Value, version: Option<Value>) -> Result<Self> {
        Ok(Self {
            claimed_version: parse_version(version)?,
            document: IncomingDocument::from_json(state)?,
        })
    }

    /// Build a request from an already parsed document and an optional version.
    pub fn new(document: IncomingDocument, claimed_version: Option<u64>) -> Self {
        Self {
            document,
            claimed_version,
        }
    }
}

impl IncomingDocument {
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Object(obj) => Self::from_object(obj),
            _ => Err(SyncError::invalid_field("state", "must be a JSON object")),
        }
    }

    fn from_object(obj: Map<String, Value>) -> Result<Self> {
        // Without a `config` key the whole payload is the config body.
        let config = match obj.get("config") {
            Some(config) => DocumentConfig::from_value(config),
            None => DocumentConfig::from_value(&Value::Object(obj.clone())),
        };

        let lines = match obj.get("lines") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(i, item)| parse_line(item, i))
                .collect::<Result<Vec<_>>>()?,
            Some(_) => return Err(SyncError::invalid_field("lines", "must be an array")),
        };

        let general_wait_queue = parse_people(obj.get("generalWaitQueue"), "generalWaitQueue")?;

        let document = Self {
            config,
            lines,
            general_wait_queue,
        };
        document.check_unique_line_names()?;
        document.check_person_ownership()?;
        Ok(document)
    }

    fn check_unique_line_names(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for (i, line) in self.lines.iter().enumerate() {
            if !seen.insert(line.name.as_str()) {
                return Err(SyncError::invalid_field(
                    format!("lines[{}].name", i),
                    format!("duplicate line name '{}'", line.name),
                ));
            }
        }
        Ok(())
    }

    /// A person id may repeat inside one list but never across containers.
    fn check_person_ownership(&self) -> Result<()> {
        // `None` stands for the general wait queue.
        let mut owner: HashMap<PersonId, Option<&str>> = HashMap::new();
        let containers = self
            .lines
            .iter()
            .map(|line| (Some(line.name.as_str()), &line.people))
            .chain(std::iter::once((None, &self.general_wait_queue)));

        for (container, people) in containers {
            for id in people.iter().filter_map(|p| p.id) {
                let existing = *owner.entry(id).or_insert(container);
                if existing != container {
                    return Err(SyncError::validation(format!(
                        "Person {} appears in both {} and {}",
                        id,
                        container_label(existing),
                        container_label(container)
                    ))
                    .with_context("person_id", id));
                }
            }
        }
        Ok(())
    }
}

fn container_label(container: Option<&str>) -> String {
    match container {
        Some(name) => format!("line '{}'", name),
        None => "the general wait queue".to_string(),
    }
}

fn parse_version(value: Option<Value>) -> Result<Option<u64>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| SyncError::invalid_field("version", "must be a non-negative integer")),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| SyncError::invalid_field("version", "must be a non-negative integer")),
        Some(_) => Err(SyncError::invalid_field(
            "version",
            "must be a non-negative integer",
        )),
    }
}

/// Person ids are positive and stay below `i64::MAX` so the next id always fits.
fn parse_person_id(value: Option<&Value>, path: &str) -> Result<Option<PersonId>> {
    let field = || format!("{}.id", path);
    let id = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        Some(_) => None,
    }
    .ok_or_else(|| SyncError::invalid_field(field(), "must be an integer"))?;

    if id <= 0 || id == PersonId::MAX {
        return Err(SyncError::invalid_field(
            field(),
            format!("must be between 1 and {}", PersonId::MAX - 1),
        ));
    }
    Ok(Some(id))
}

fn parse_line(value: &Value, index: usize) -> Result<IncomingLine> {
    let path = format!("lines[{}]", index);
    let obj = value
        .as_object()
        .ok_or_else(|| SyncError::invalid_field(path.clone(), "must be an object"))?;

    let name = match obj.get("name") {
        Some(Value::String(name)) if !name.trim().is_empty() => name.clone(),
        _ => {
            return Err(SyncError::invalid_field(
                format!("{}.name", path),
                "must be a non-empty string",
            ))
        }
    };

    let time = match obj.get("time") {
        Some(Value::String(time)) => time.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };

    let people = parse_people(obj.get("people"), &format!("{}.people", path))?;

    Ok(IncomingLine { name, time, people })
}

fn parse_people(value: Option<&Value>, path: &str) -> Result<Vec<IncomingPerson>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, item)| parse_person(item, &format!("{}[{}]", path, i)))
            .collect(),
        Some(_) => Err(SyncError::invalid_field(path.to_string(), "must be an array")),
    }
}

fn parse_person(value: &Value, path: &str) -> Result<IncomingPerson> {
    let obj = value
        .as_object()
        .ok_or_else(|| SyncError::invalid_field(path.to_string(), "must be an object"))?;

    let name = match obj.get("name") {
        Some(Value::String(name)) => name.clone(),
        _ => {
            return Err(SyncError::invalid_field(
                format!("{}.name", path),
                "must be a string",
            ))
        }
    };

    let id = parse_person_id(obj.get("id"), path)?;

    // An unreadable timestamp is dropped; the server stamps the person instead.
    let created_at = obj
        .get("createdAt")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    Ok(IncomingPerson {
        id,
        name,
        created_at,
    })
}
