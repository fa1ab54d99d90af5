//! Core survey-response model for qpsync.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "qpsync-core";

/// Destination column holding the API's `responseID`, verbatim.
pub const RESPONSE_ID_COLUMN: &str = "responseID";
/// Destination column holding the parsed submission time.
pub const TIMESTAMP_COLUMN: &str = "timestamp";
pub const ANSWER_SEPARATOR: &str = ", ";
/// Text form of timestamp keys; the database side renders with `to_char(.., 'YYYY-MM-DD HH24:MI:SS')`.
pub const TIMESTAMP_KEY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One survey submission as returned by the responses endpoint.
///
/// Unknown fields are kept in `extra` so raw archives round-trip the payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawResponse {
    #[serde(rename = "responseID", default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(rename = "responseSet", default)]
    pub response_set: Vec<AnswerGroup>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl RawResponse {
    /// `responseID` rendered as text; the API sends either a number or a string.
    pub fn response_id_text(&self) -> Option<String> {
        match self.response_id.as_ref()? {
            JsonValue::Null => None,
            JsonValue::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AnswerGroup {
    #[serde(rename = "questionCode", default, skip_serializing_if = "Option::is_none")]
    pub question_code: Option<String>,
    #[serde(rename = "answerValues", default)]
    pub answer_values: Vec<AnswerValue>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// A single answer: either `answerText` directly or `value.text` nested.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AnswerValue {
    #[serde(rename = "answerText", default, skip_serializing_if = "Option::is_none")]
    pub answer_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<JsonValue>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl AnswerValue {
    pub fn direct(text: impl Into<String>) -> Self {
        Self {
            answer_text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn nested(text: impl Into<String>) -> Self {
        Self {
            value: Some(serde_json::json!({ "text": text.into() })),
            ..Default::default()
        }
    }

    /// Trimmed answer text, preferring the direct form. Empty resolves to `None`.
    pub fn resolved_text(&self) -> Option<&str> {
        let direct = self.answer_text.as_deref().filter(|t| !t.is_empty());
        let text = match direct {
            Some(text) => text,
            None => self
                .value
                .as_ref()
                .and_then(|v| v.get("text"))
                .and_then(JsonValue::as_str)?,
        };
        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    }
}

/// Which column is the dedup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    /// The parsed submission time in the `timestamp` column.
    #[default]
    Timestamp,
    /// The API's `responseID`.
    ResponseId,
}

impl IdentitySource {
    pub fn column(self) -> &'static str {
        match self {
            Self::Timestamp => TIMESTAMP_COLUMN,
            Self::ResponseId => RESPONSE_ID_COLUMN,
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("unknown identity source `{0}` (expected `timestamp` or `response_id`)")]
pub struct ParseIdentitySourceError(String);

impl FromStr for IdentitySource {
    type Err = ParseIdentitySourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "timestamp" => Ok(Self::Timestamp),
            "response_id" | "responseid" => Ok(Self::ResponseId),
            other => Err(ParseIdentitySourceError(other.to_string())),
        }
    }
}

impl fmt::Display for IdentitySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timestamp => f.write_str("timestamp"),
            Self::ResponseId => f.write_str("response_id"),
        }
    }
}

/// A typed value bound into a destination column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Cell {
    Null,
    Text(String),
    Timestamp(NaiveDateTime),
}

impl Cell {
    /// Text form used for dedup keys and columnar export; `Null` has none.
    pub fn render(&self) -> Option<String> {
        match self {
            Cell::Null => None,
            Cell::Text(text) => Some(text.clone()),
            Cell::Timestamp(ts) => Some(timestamp_key(ts)),
        }
    }
}

pub fn timestamp_key(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_KEY_FORMAT).to_string()
}

/// One flattened response, materialized against its [`RowSet`] column list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatRow {
    /// Dedup key: the rendered identity column value.
    pub key: String,
    pub response_id: Option<String>,
    pub submitted_at: NaiveDateTime,
    /// Aligned with [`RowSet::question_codes`]; unanswered questions are `""`.
    pub answers: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FlattenStats {
    pub responses: usize,
    pub dropped_unparsable: usize,
    pub groups_without_code: usize,
    pub reserved_codes: usize,
}

/// Flattened batch: the column union plus every row that survived parsing.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RowSet {
    pub identity: IdentitySource,
    pub question_codes: Vec<String>,
    pub rows: Vec<FlatRow>,
    pub stats: FlattenStats,
}

impl RowSet {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Ordered column list shared by every row.
    pub fn columns(&self) -> Vec<&str> {
        let mut columns = Vec::with_capacity(self.question_codes.len() + 2);
        columns.push(RESPONSE_ID_COLUMN);
        columns.push(TIMESTAMP_COLUMN);
        columns.extend(self.question_codes.iter().map(String::as_str));
        columns
    }

    pub fn identity_column(&self) -> &'static str {
        self.identity.column()
    }

    /// Row values in [`RowSet::columns`] order.
    pub fn cells(&self, row: &FlatRow) -> Vec<Cell> {
        let mut cells = Vec::with_capacity(self.question_codes.len() + 2);
        cells.push(row.response_id.clone().map_or(Cell::Null, Cell::Text));
        cells.push(Cell::Timestamp(row.submitted_at));
        for idx in 0..self.question_codes.len() {
            cells.push(Cell::Text(row.answers.get(idx).cloned().unwrap_or_default()));
        }
        cells
    }

    pub fn answer<'a>(&self, row: &'a FlatRow, question_code: &str) -> Option<&'a str> {
        let idx = self.question_codes.iter().position(|c| c == question_code)?;
        row.answers.get(idx).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn raw_response_accepts_numeric_ids_and_keeps_unknown_fields() {
        let raw: RawResponse = serde_json::from_value(serde_json::json!({
            "responseID": 90112,
            "timestamp": "05 Jan, 2024 03:15:00 PM ART",
            "ipAddress": "10.0.0.1",
            "responseSet": [
                {"questionCode": "Q1", "answerValues": [{"answerText": "Red"}]}
            ]
        }))
        .expect("deserialize");

        assert_eq!(raw.response_id_text().as_deref(), Some("90112"));
        assert_eq!(raw.response_set.len(), 1);
        assert_eq!(raw.extra.get("ipAddress"), Some(&serde_json::json!("10.0.0.1")));

        let back = serde_json::to_value(&raw).expect("serialize");
        assert_eq!(back["ipAddress"], "10.0.0.1");
        assert_eq!(back["responseID"], 90112);
    }

    #[test]
    fn answer_text_prefers_direct_then_nested() {
        assert_eq!(AnswerValue::direct("  Red ").resolved_text(), Some("Red"));
        assert_eq!(AnswerValue::nested("Blue").resolved_text(), Some("Blue"));

        let both = AnswerValue {
            answer_text: Some(String::new()),
            value: Some(serde_json::json!({"text": "Green"})),
            ..Default::default()
        };
        assert_eq!(both.resolved_text(), Some("Green"));

        let blank = AnswerValue {
            answer_text: Some("   ".into()),
            value: Some(serde_json::json!({})),
            ..Default::default()
        };
        assert_eq!(blank.resolved_text(), None);
    }

    #[test]
    fn identity_source_parses_both_spellings() {
        assert_eq!("timestamp".parse::<IdentitySource>().unwrap(), IdentitySource::Timestamp);
        assert_eq!(" Response_ID ".parse::<IdentitySource>().unwrap(), IdentitySource::ResponseId);
        assert!("uuid".parse::<IdentitySource>().is_err());
    }

    #[test]
    fn timestamp_cells_render_iso_keys() {
        let ts = NaiveDate::from_ymd_opt(2024, 1, 5)
            .and_then(|d| d.and_hms_opt(15, 15, 0))
            .unwrap();
        assert_eq!(Cell::Timestamp(ts).render().as_deref(), Some("2024-01-05 15:15:00"));
        assert_eq!(Cell::Text("abc".into()).render().as_deref(), Some("abc"));
        assert_eq!(Cell::Null.render(), None);
    }

    #[test]
    fn cells_keep_response_id_and_parsed_time_in_their_own_columns() {
        let ts = NaiveDate::from_ymd_opt(2024, 1, 5)
            .and_then(|d| d.and_hms_opt(15, 15, 0))
            .unwrap();
        let set = RowSet {
            identity: IdentitySource::Timestamp,
            question_codes: vec!["Q1".into()],
            rows: vec![FlatRow {
                key: timestamp_key(&ts),
                response_id: Some("120001".into()),
                submitted_at: ts,
                answers: vec!["Red".into()],
            }],
            ..Default::default()
        };

        assert_eq!(set.columns(), vec![RESPONSE_ID_COLUMN, TIMESTAMP_COLUMN, "Q1"]);
        assert_eq!(set.identity_column(), TIMESTAMP_COLUMN);
        assert_eq!(
            set.cells(&set.rows[0]),
            vec![
                Cell::Text("120001".into()),
                Cell::Timestamp(ts),
                Cell::Text("Red".into()),
            ]
        );
        assert_eq!(IdentitySource::ResponseId.column(), RESPONSE_ID_COLUMN);
    }
}
