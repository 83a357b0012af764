//! Core domain model for ESQ Relay: submissions, answers, flat records, digests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

pub const CRATE_NAME: &str = "esqr-core";

/// Question key carrying the respondent's self-declared role.
pub const ROLE_QUESTION: &str = "hvem_udfylder_spoergeskemaet";

/// Respondent role declared inside the submission itself. Anything other than
/// the two recognized answers filters the submission out of every pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    SelfReport,
    ParentReport,
}

impl Role {
    pub const SELF_ANSWER: &'static str = "Ung/selvbesvarelse";
    pub const PARENT_ANSWER: &'static str = "Forælder (inklusiv plejeforældre)";

    pub fn from_answer(answer: &str) -> Option<Self> {
        match answer {
            Self::SELF_ANSWER => Some(Role::SelfReport),
            Self::PARENT_ANSWER => Some(Role::ParentReport),
            _ => None,
        }
    }

    pub fn answer(&self) -> &'static str {
        match self {
            Role::SelfReport => Self::SELF_ANSWER,
            Role::ParentReport => Self::PARENT_ANSWER,
        }
    }
}

/// One stored form submission as fetched from the relational source.
/// Immutable once fetched; rows with a purge marker never reach this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSubmission {
    pub form_id: String,
    pub submitted_at: DateTime<Utc>,
    pub payload: JsonValue,
}

impl RawSubmission {
    /// Unique serial assigned by the form backend, at `entity.serial[0].value`.
    /// Accepts both string and numeric encodings; `None` marks the submission
    /// malformed and the caller skips it.
    pub fn serial(&self) -> Option<String> {
        let value = self
            .payload
            .get("entity")?
            .get("serial")?
            .get(0)?
            .get("value")?;
        scalar_to_text(value)
    }

    pub fn answers(&self) -> AnswerMap<'_> {
        AnswerMap::new(self.payload.get("data").and_then(JsonValue::as_object))
    }

    pub fn is_purged(&self) -> bool {
        self.payload.get("purged").is_some()
    }

    /// The role answer as written by the respondent, if any.
    pub fn role(&self) -> Option<Role> {
        self.answers().text(ROLE_QUESTION).and_then(Role::from_answer)
    }
}

fn scalar_to_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Schema-free lookup over the submission's answer object with null-on-missing
/// semantics: absent keys and JSON nulls read as `None`, never as an error.
#[derive(Debug, Clone, Copy)]
pub struct AnswerMap<'a> {
    data: Option<&'a JsonMap<String, JsonValue>>,
}

impl<'a> AnswerMap<'a> {
    pub fn new(data: Option<&'a JsonMap<String, JsonValue>>) -> Self {
        Self { data }
    }

    pub fn get(&self, key: &str) -> Option<&'a JsonValue> {
        let value = self.data?.get(key)?;
        if value.is_null() {
            None
        } else {
            Some(value)
        }
    }

    pub fn text(&self, key: &str) -> Option<&'a str> {
        self.get(key)?.as_str()
    }

    /// Numeric answers arrive either as JSON numbers or as digit strings
    /// (radio/select labels). Anything else reads as `None`.
    pub fn number(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            JsonValue::Number(n) => n.as_f64(),
            JsonValue::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }
}

/// One cell of a flat record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Number(f64),
    Text(String),
    Empty,
}

impl CellValue {
    pub fn from_answer(value: Option<&JsonValue>) -> Self {
        match value {
            Some(JsonValue::Number(n)) => n
                .as_f64()
                .map(CellValue::Number)
                .unwrap_or(CellValue::Empty),
            Some(JsonValue::String(s)) => CellValue::Text(s.clone()),
            Some(JsonValue::Bool(b)) => CellValue::Text(b.to_string()),
            _ => CellValue::Empty,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
            || matches!(self, CellValue::Text(s) if s.trim().is_empty())
    }

    /// Display form used for both spreadsheet cells and email rows.
    pub fn render(&self) -> String {
        match self {
            CellValue::Number(n) if n.fract() == 0.0 => format!("{}", *n as i64),
            CellValue::Number(n) => format!("{n:.1}"),
            CellValue::Text(s) => s.clone(),
            CellValue::Empty => String::new(),
        }
    }
}

/// Ordered mapping of output column label to value, produced by applying
/// exactly one field mapping to exactly one submission. Column order is the
/// mapping's order and is preserved through export and rendering.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FlatRecord {
    columns: Vec<(String, CellValue)>,
}

impl FlatRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, label: impl Into<String>, value: CellValue) {
        self.columns.push((label.into(), value));
    }

    pub fn get(&self, label: &str) -> Option<&CellValue> {
        self.columns
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, v)| v)
    }

    pub fn labels(&self) -> Vec<&str> {
        self.columns.iter().map(|(l, _)| l.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CellValue)> {
        self.columns.iter().map(|(l, v)| (l.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// One grouped email covering every record for one subject in a fetch window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Digest {
    pub subject_id: String,
    pub recipient: String,
    pub html_body: String,
    pub source_record_count: usize,
}

/// Queue payload carried by one work item; `reference` on the item itself is
/// the subject identifier and the queue's dedup key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestPayload {
    pub recipient: String,
    pub subject_id: String,
    pub html_body: String,
}

impl From<&Digest> for DigestPayload {
    fn from(digest: &Digest) -> Self {
        Self {
            recipient: digest.recipient.clone(),
            subject_id: digest.subject_id.clone(),
            html_body: digest.html_body.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn submission(payload: JsonValue) -> RawSubmission {
        RawSubmission {
            form_id: "f-1".to_string(),
            submitted_at: "2026-07-14T09:30:00Z".parse().unwrap(),
            payload,
        }
    }

    #[test]
    fn role_recognizes_exactly_two_answers() {
        assert_eq!(
            Role::from_answer("Ung/selvbesvarelse"),
            Some(Role::SelfReport)
        );
        assert_eq!(
            Role::from_answer("Forælder (inklusiv plejeforældre)"),
            Some(Role::ParentReport)
        );
        assert_eq!(Role::from_answer("Lærer"), None);
        assert_eq!(Role::from_answer(""), None);
    }

    #[test]
    fn serial_reads_string_and_numeric_encodings() {
        let s = submission(json!({
            "entity": { "serial": [{ "value": "4711" }] },
            "data": {}
        }));
        assert_eq!(s.serial().as_deref(), Some("4711"));

        let n = submission(json!({
            "entity": { "serial": [{ "value": 4711 }] },
            "data": {}
        }));
        assert_eq!(n.serial().as_deref(), Some("4711"));

        let missing = submission(json!({ "data": {} }));
        assert_eq!(missing.serial(), None);
    }

    #[test]
    fn answer_map_reads_null_and_missing_as_none() {
        let s = submission(json!({
            "data": { "navn": "Mia", "alder": null }
        }));
        let answers = s.answers();
        assert_eq!(answers.text("navn"), Some("Mia"));
        assert_eq!(answers.get("alder"), None);
        assert_eq!(answers.get("ukendt_noegle"), None);
    }

    #[test]
    fn answer_map_parses_numbers_from_numbers_and_digit_strings() {
        let s = submission(json!({
            "data": { "a": 4, "b": "2", "c": " 3 ", "d": "n/a" }
        }));
        let answers = s.answers();
        assert_eq!(answers.number("a"), Some(4.0));
        assert_eq!(answers.number("b"), Some(2.0));
        assert_eq!(answers.number("c"), Some(3.0));
        assert_eq!(answers.number("d"), None);
    }

    #[test]
    fn purge_marker_is_detected_regardless_of_value() {
        let purged = submission(json!({ "purged": true, "data": {} }));
        assert!(purged.is_purged());
        let kept = submission(json!({ "data": {} }));
        assert!(!kept.is_purged());
    }

    #[test]
    fn cell_render_drops_trailing_zero_fraction() {
        assert_eq!(CellValue::Number(3.0).render(), "3");
        assert_eq!(CellValue::Number(3.5).render(), "3.5");
        assert_eq!(CellValue::Text("hej".into()).render(), "hej");
        assert_eq!(CellValue::Empty.render(), "");
    }

    #[test]
    fn flat_record_preserves_column_order() {
        let mut record = FlatRecord::new();
        record.push("Serienummer", CellValue::Text("1".into()));
        record.push("Navn", CellValue::Text("Mia".into()));
        assert_eq!(record.labels(), vec!["Serienummer", "Navn"]);
        assert_eq!(record.get("Navn"), Some(&CellValue::Text("Mia".into())));
        assert_eq!(record.get("Alder"), None);
    }
}
