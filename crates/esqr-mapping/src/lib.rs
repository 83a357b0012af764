//! Role-keyed field mappings and the submission-to-record transform engine.

use esqr_core::{AnswerMap, CellValue, FlatRecord, RawSubmission, Role, ROLE_QUESTION};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "esqr-mapping";

pub const COL_SERIAL: &str = "Serienummer";
pub const COL_SUBMITTED: &str = "Besvarelsesdato";
pub const COL_CPR: &str = "Cpr-nummer";
pub const COL_NAME: &str = "Navn";
pub const COL_AGE: &str = "Alder";
pub const COL_FILLED_BY: &str = "Udfyldt af";
pub const COL_PARENT_NAME: &str = "Forælders navn";
pub const COL_PARENT_CPR: &str = "Forælders cpr-nummer";
pub const COL_AVERAGE: &str = "Gennemsnitlig score";

/// Question keys feeding the derived average. All score items are answered on
/// a numeric scale; missing or non-numeric answers are excluded from both sum
/// and count.
pub const SCORE_KEYS: &[&str] = &[
    "blev_taget_alvorligt",
    "foelte_mig_lyttet_til",
    "fik_den_hjaelp_jeg_havde_brug_for",
    "let_at_tale_med_behandleren",
    "tilfreds_med_forloebet",
    "vil_anbefale_tilbuddet",
];

const SCORE_COLUMNS: &[(&str, &str)] = &[
    ("Jeg blev taget alvorligt", "blev_taget_alvorligt"),
    ("Jeg følte mig lyttet til", "foelte_mig_lyttet_til"),
    (
        "Jeg fik den hjælp, jeg havde brug for",
        "fik_den_hjaelp_jeg_havde_brug_for",
    ),
    (
        "Det var let at tale med behandleren",
        "let_at_tale_med_behandleren",
    ),
    ("Jeg er tilfreds med forløbet", "tilfreds_med_forloebet"),
    (
        "Jeg vil anbefale tilbuddet til andre",
        "vil_anbefale_tilbuddet",
    ),
];

/// Sub-table of contact questions flattened under display labels.
const CONTACT_TABLE: &[(&str, &str)] = &[
    ("kontakt_telefon", "Telefonnummer"),
    ("kontakt_email", "E-mail"),
];

/// How one output column gets its value.
#[derive(Debug, Clone, Copy)]
pub enum ColumnRule {
    /// The submission serial passed into the transform.
    Serial,
    /// The submission timestamp, rendered as a date.
    SubmittedDate,
    /// Direct copy of one answer; missing keys yield an empty cell.
    Answer(&'static str),
    /// Sub-table of (question key, display label) pairs, each flattened into
    /// its own column under the display label.
    Table(&'static [(&'static str, &'static str)]),
    /// Arithmetic mean over the numeric answers among the given keys.
    AverageOf(&'static [&'static str]),
}

/// Ordered mapping table for one respondent role. Both variants share a base
/// column list; the parent variant inserts the guardian's own name and
/// identifier. The serial always leads and the derived average always closes.
#[derive(Debug, Clone)]
pub struct FieldMapping {
    pub role: Role,
    columns: Vec<(&'static str, ColumnRule)>,
}

impl FieldMapping {
    pub fn for_role(role: Role) -> Self {
        let mut columns: Vec<(&'static str, ColumnRule)> = vec![
            (COL_SERIAL, ColumnRule::Serial),
            (COL_SUBMITTED, ColumnRule::SubmittedDate),
            (COL_CPR, ColumnRule::Answer("cpr_nummer")),
            (COL_NAME, ColumnRule::Answer("navn")),
            (COL_AGE, ColumnRule::Answer("alder")),
            (COL_FILLED_BY, ColumnRule::Answer(ROLE_QUESTION)),
        ];

        if role == Role::ParentReport {
            columns.push((COL_PARENT_NAME, ColumnRule::Answer("foraelders_navn")));
            columns.push((COL_PARENT_CPR, ColumnRule::Answer("foraelders_cpr_nummer")));
        }

        columns.push(("Kontaktoplysninger", ColumnRule::Table(CONTACT_TABLE)));
        for &(label, key) in SCORE_COLUMNS {
            columns.push((label, ColumnRule::Answer(key)));
        }
        columns.push(("Hvad var godt?", ColumnRule::Answer("hvad_var_godt")));
        columns.push((
            "Hvad kan gøres bedre?",
            ColumnRule::Answer("hvad_kan_goeres_bedre"),
        ));
        columns.push((COL_AVERAGE, ColumnRule::AverageOf(SCORE_KEYS)));

        Self { role, columns }
    }

    pub fn columns(&self) -> &[(&'static str, ColumnRule)] {
        &self.columns
    }

    /// Flat output column labels, with table rules expanded to their display
    /// labels. This is the export header row.
    pub fn output_labels(&self) -> Vec<&'static str> {
        let mut labels = Vec::with_capacity(self.columns.len() + 1);
        for &(label, rule) in &self.columns {
            match rule {
                ColumnRule::Table(entries) => {
                    labels.extend(entries.iter().map(|&(_, sub_label)| sub_label));
                }
                _ => labels.push(label),
            }
        }
        labels
    }
}

/// Both role variants, built once per run and borrowed everywhere.
#[derive(Debug, Clone)]
pub struct MappingSet {
    self_report: FieldMapping,
    parent_report: FieldMapping,
}

impl MappingSet {
    pub fn new() -> Self {
        Self {
            self_report: FieldMapping::for_role(Role::SelfReport),
            parent_report: FieldMapping::for_role(Role::ParentReport),
        }
    }

    pub fn get(&self, role: Role) -> &FieldMapping {
        match role {
            Role::SelfReport => &self.self_report,
            Role::ParentReport => &self.parent_report,
        }
    }
}

impl Default for MappingSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Why one submission was dropped from a batch. Skips are logged with the
/// submission serial (when known) and never abort the batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkipReason {
    #[error("submission has no serial")]
    MissingSerial,
    #[error("unrecognized or missing role answer")]
    UnrecognizedRole,
    #[error("record has no subject identifier")]
    MissingSubject,
}

/// Apply one mapping to one submission. Pure over its inputs: missing answers
/// become empty cells and the average degrades to empty rather than erroring.
pub fn transform(serial: &str, submission: &RawSubmission, mapping: &FieldMapping) -> FlatRecord {
    let answers = submission.answers();
    let mut record = FlatRecord::new();

    for &(label, rule) in mapping.columns() {
        match rule {
            ColumnRule::Serial => record.push(label, CellValue::Text(serial.to_string())),
            ColumnRule::SubmittedDate => record.push(
                label,
                CellValue::Text(submission.submitted_at.format("%Y-%m-%d").to_string()),
            ),
            ColumnRule::Answer(key) => {
                record.push(label, CellValue::from_answer(answers.get(key)));
            }
            ColumnRule::Table(entries) => {
                for &(key, sub_label) in entries {
                    record.push(sub_label, CellValue::from_answer(answers.get(key)));
                }
            }
            ColumnRule::AverageOf(keys) => {
                let cell = average_score(&answers, keys)
                    .map(CellValue::Number)
                    .unwrap_or(CellValue::Empty);
                record.push(label, cell);
            }
        }
    }

    record
}

/// Mean of the numeric answers among `keys`; `None` when no answer is numeric.
pub fn average_score(answers: &AnswerMap<'_>, keys: &[&str]) -> Option<f64> {
    let values: Vec<f64> = keys.iter().filter_map(|key| answers.number(key)).collect();
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Role-dispatching flatten of one submission. Returns `None` for malformed
/// or unrecognized-role submissions, logging the reason; the batch caller just
/// moves on.
pub fn flatten_submission(
    submission: &RawSubmission,
    mappings: &MappingSet,
) -> Option<(Role, FlatRecord)> {
    let serial = match submission.serial() {
        Some(serial) => serial,
        None => {
            warn!(form_id = %submission.form_id, "skipping submission: {}", SkipReason::MissingSerial);
            return None;
        }
    };

    let role = match submission.role() {
        Some(role) => role,
        None => {
            debug!(%serial, "skipping submission: {}", SkipReason::UnrecognizedRole);
            return None;
        }
    };

    let record = transform(&serial, submission, mappings.get(role));
    let subject_missing = record
        .get(COL_CPR)
        .map(CellValue::is_empty)
        .unwrap_or(true);
    if subject_missing {
        warn!(%serial, "skipping submission: {}", SkipReason::MissingSubject);
        return None;
    }

    Some((role, record))
}

/// Flatten a batch down to the records of one role, preserving arrival order.
pub fn flatten_submissions(
    submissions: &[RawSubmission],
    mappings: &MappingSet,
    role: Role,
) -> Vec<FlatRecord> {
    submissions
        .iter()
        .filter_map(|submission| flatten_submission(submission, mappings))
        .filter(|(record_role, _)| *record_role == role)
        .map(|(_, record)| record)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn submission_with(role_answer: &str, extra: serde_json::Value) -> RawSubmission {
        let mut data = json!({
            "hvem_udfylder_spoergeskemaet": role_answer,
            "cpr_nummer": "1111111111",
            "navn": "Mia Jensen",
            "alder": "14",
        });
        if let (Some(map), Some(extra_map)) = (data.as_object_mut(), extra.as_object()) {
            for (k, v) in extra_map {
                map.insert(k.clone(), v.clone());
            }
        }
        RawSubmission {
            form_id: "f-1".to_string(),
            submitted_at: "2026-07-14T09:30:00Z".parse().unwrap(),
            payload: json!({
                "entity": { "serial": [{ "value": "9001" }] },
                "data": data,
            }),
        }
    }

    #[test]
    fn average_excludes_missing_and_non_numeric_answers() {
        let s = submission_with(
            Role::SELF_ANSWER,
            json!({
                "blev_taget_alvorligt": 4,
                "foelte_mig_lyttet_til": null,
                "fik_den_hjaelp_jeg_havde_brug_for": "n/a",
                "let_at_tale_med_behandleren": "2",
            }),
        );
        let keys = [
            "blev_taget_alvorligt",
            "foelte_mig_lyttet_til",
            "fik_den_hjaelp_jeg_havde_brug_for",
            "let_at_tale_med_behandleren",
        ];
        assert_eq!(average_score(&s.answers(), &keys), Some(3.0));
    }

    #[test]
    fn average_of_all_missing_answers_is_none_not_a_fault() {
        let s = submission_with(Role::SELF_ANSWER, json!({}));
        assert_eq!(average_score(&s.answers(), SCORE_KEYS), None);

        let record = transform("9001", &s, &FieldMapping::for_role(Role::SelfReport));
        assert_eq!(record.get(COL_AVERAGE), Some(&CellValue::Empty));
    }

    #[test]
    fn direct_copy_of_missing_key_yields_empty_cell() {
        let s = submission_with(Role::SELF_ANSWER, json!({}));
        let record = transform("9001", &s, &FieldMapping::for_role(Role::SelfReport));
        assert_eq!(record.get("Hvad var godt?"), Some(&CellValue::Empty));
    }

    #[test]
    fn parent_mapping_adds_guardian_columns() {
        let parent = FieldMapping::for_role(Role::ParentReport);
        let own = FieldMapping::for_role(Role::SelfReport);
        assert!(parent.output_labels().contains(&COL_PARENT_NAME));
        assert!(parent.output_labels().contains(&COL_PARENT_CPR));
        assert!(!own.output_labels().contains(&COL_PARENT_NAME));
        assert!(!own.output_labels().contains(&COL_PARENT_CPR));
    }

    #[test]
    fn serial_leads_and_average_closes_both_mappings() {
        for role in [Role::SelfReport, Role::ParentReport] {
            let labels = FieldMapping::for_role(role).output_labels();
            assert_eq!(labels.first(), Some(&COL_SERIAL));
            assert_eq!(labels.last(), Some(&COL_AVERAGE));
        }
    }

    #[test]
    fn table_rule_flattens_sub_questions_under_display_labels() {
        let s = submission_with(
            Role::SELF_ANSWER,
            json!({ "kontakt_telefon": "12345678", "kontakt_email": "mia@example.org" }),
        );
        let record = transform("9001", &s, &FieldMapping::for_role(Role::SelfReport));
        assert_eq!(
            record.get("Telefonnummer"),
            Some(&CellValue::Text("12345678".into()))
        );
        assert_eq!(
            record.get("E-mail"),
            Some(&CellValue::Text("mia@example.org".into()))
        );
        assert_eq!(record.get("Kontaktoplysninger"), None);
    }

    #[test]
    fn transform_renders_submission_timestamp_as_date() {
        let s = submission_with(Role::SELF_ANSWER, json!({}));
        let record = transform("9001", &s, &FieldMapping::for_role(Role::SelfReport));
        assert_eq!(
            record.get(COL_SUBMITTED),
            Some(&CellValue::Text("2026-07-14".into()))
        );
    }

    #[test]
    fn record_columns_match_the_mappings_output_labels() {
        let mappings = MappingSet::new();
        for role in [Role::SelfReport, Role::ParentReport] {
            let answer = match role {
                Role::SelfReport => Role::SELF_ANSWER,
                Role::ParentReport => Role::PARENT_ANSWER,
            };
            let record = transform("9001", &submission_with(answer, json!({})), mappings.get(role));
            assert_eq!(record.labels(), mappings.get(role).output_labels());
        }
    }

    #[test]
    fn flatten_keeps_only_the_requested_role() {
        let mappings = MappingSet::new();
        let submissions = vec![
            submission_with(Role::SELF_ANSWER, json!({})),
            submission_with(Role::PARENT_ANSWER, json!({})),
            submission_with("Lærer", json!({})),
        ];
        let own = flatten_submissions(&submissions, &mappings, Role::SelfReport);
        assert_eq!(own.len(), 1);
        let parent = flatten_submissions(&submissions, &mappings, Role::ParentReport);
        assert_eq!(parent.len(), 1);
    }

    #[test]
    fn unrecognized_role_is_filtered_not_transformed() {
        let mappings = MappingSet::new();
        let other = submission_with("Lærer", json!({}));
        assert_eq!(flatten_submission(&other, &mappings), None);
    }

    #[test]
    fn flatten_skips_malformed_submissions_without_aborting() {
        let mappings = MappingSet::new();

        let mut no_serial = submission_with(Role::SELF_ANSWER, json!({}));
        no_serial.payload["entity"] = json!({});

        let mut no_subject = submission_with(Role::SELF_ANSWER, json!({}));
        no_subject.payload["data"]["cpr_nummer"] = json!(null);

        let ok = submission_with(Role::SELF_ANSWER, json!({}));

        let records =
            flatten_submissions(&[no_serial, no_subject, ok], &mappings, Role::SelfReport);
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].get(COL_CPR),
            Some(&CellValue::Text("1111111111".into()))
        );
    }
}
