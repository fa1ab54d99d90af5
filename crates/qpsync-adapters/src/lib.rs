//! QuestionPro response extraction + flattening into tabular rows.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use qpsync_core::{
    timestamp_key, AnswerValue, FlatRow, FlattenStats, IdentitySource, RawResponse, RowSet,
    ANSWER_SEPARATOR, RESPONSE_ID_COLUMN, TIMESTAMP_COLUMN,
};
use qpsync_storage::{FetchError, HttpFetcher};
use reqwest::header::{HeaderMap, HeaderValue, InvalidHeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "qpsync-adapters";

pub const PAGE_SIZE: u32 = 100;
/// Submission timestamp layout, e.g. `05 Jan, 2024 03:15:00 PM`.
pub const TIMESTAMP_FORMAT: &str = "%d %b, %Y %I:%M:%S %p";
pub const DEFAULT_TIMEZONE_MARKER: &str = " ART";

/// API root for a regional QuestionPro domain such as `questionpro.com`.
pub fn api_base_url(env_domain: &str) -> String {
    format!("https://api.{}/a/api/v2", env_domain.trim().trim_matches('/'))
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Pagination {
    #[serde(rename = "totalPages")]
    pub total_pages: u32,
}

/// Body of `GET /surveys/{id}/responses`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ResponsePage {
    #[serde(default)]
    pub response: Vec<RawResponse>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PageOutcome {
    Page(ResponsePage),
    Rejected { status: u16, body: String },
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding responses page {page}: {source}")]
    Decode {
        page: u32,
        #[source]
        source: serde_json::Error,
    },
    #[error("api key is not a valid header value: {0}")]
    InvalidApiKey(#[from] InvalidHeaderValue),
}

pub fn decode_page(page: u32, body: &[u8]) -> Result<ResponsePage, ExtractError> {
    serde_json::from_slice(body).map_err(|source| ExtractError::Decode { page, source })
}

/// One page of survey responses at a time.
#[async_trait]
pub trait ResponsePageSource: Send + Sync {
    fn survey_id(&self) -> &str;

    async fn fetch_page(&self, page: u32, per_page: u32) -> Result<PageOutcome, ExtractError>;
}

/// Live source backed by the QuestionPro v2 REST API.
#[derive(Debug, Clone)]
pub struct QuestionProSource {
    http: HttpFetcher,
    base_url: String,
    survey_id: String,
    headers: HeaderMap,
}

impl QuestionProSource {
    pub fn new(
        http: HttpFetcher,
        base_url: impl Into<String>,
        survey_id: impl Into<String>,
        api_key: &str,
    ) -> Result<Self, ExtractError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let mut key = HeaderValue::from_str(api_key)?;
        key.set_sensitive(true);
        headers.insert("api-key", key);

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            survey_id: survey_id.into(),
            headers,
        })
    }

    pub fn page_url(&self, page: u32, per_page: u32) -> String {
        format!(
            "{}/surveys/{}/responses?page={page}&perPage={per_page}",
            self.base_url, self.survey_id
        )
    }
}

#[async_trait]
impl ResponsePageSource for QuestionProSource {
    fn survey_id(&self) -> &str {
        &self.survey_id
    }

    async fn fetch_page(&self, page: u32, per_page: u32) -> Result<PageOutcome, ExtractError> {
        let url = self.page_url(page, per_page);
        let fetched = self.http.get(&url, &self.headers).await?;
        if !fetched.status.is_success() {
            return Ok(PageOutcome::Rejected {
                status: fetched.status.as_u16(),
                body: fetched.body_text(),
            });
        }
        decode_page(page, &fetched.body).map(PageOutcome::Page)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractionHalt {
    pub page: u32,
    pub status: u16,
    pub body: String,
}

impl ExtractionHalt {
    pub fn describe(&self) -> String {
        format!(
            "extraction stopped at page {} with status {}",
            self.page, self.status
        )
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Extraction {
    pub responses: Vec<RawResponse>,
    pub pages_fetched: u32,
    pub total_pages: Option<u32>,
    /// Set when the API answered a page with a non-success status.
    pub halted: Option<ExtractionHalt>,
}

impl Extraction {
    pub fn is_complete(&self) -> bool {
        self.halted.is_none()
    }
}

/// Page through every response until `totalPages` or the first rejected page.
pub async fn extract_all<S>(source: &S) -> Result<Extraction, ExtractError>
where
    S: ResponsePageSource + ?Sized,
{
    let mut extraction = Extraction::default();
    let mut page = 1u32;

    loop {
        match source.fetch_page(page, PAGE_SIZE).await? {
            PageOutcome::Rejected { status, body } => {
                warn!(
                    survey_id = source.survey_id(),
                    page, status, body = %body,
                    "responses endpoint rejected page; keeping what was fetched"
                );
                extraction.halted = Some(ExtractionHalt { page, status, body });
                break;
            }
            PageOutcome::Page(ResponsePage {
                response,
                pagination,
            }) => {
                info!(page, responses = response.len(), "page downloaded");
                extraction.responses.extend(response);
                extraction.pages_fetched += 1;
                extraction.total_pages = Some(pagination.total_pages);
                if page >= pagination.total_pages {
                    break;
                }
                page += 1;
            }
        }
    }

    info!(
        survey_id = source.survey_id(),
        total = extraction.responses.len(),
        pages = extraction.pages_fetched,
        "extraction finished"
    );
    Ok(extraction)
}

/// Fetch every response of `survey_id` from the API rooted at `base_url`.
pub async fn fetch_all(
    http: &HttpFetcher,
    base_url: &str,
    survey_id: &str,
    api_key: &str,
) -> Result<Extraction, ExtractError> {
    let source = QuestionProSource::new(http.clone(), base_url, survey_id, api_key)?;
    extract_all(&source).await
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlattenOptions {
    pub identity: IdentitySource,
    pub timezone_marker: String,
}

impl Default for FlattenOptions {
    fn default() -> Self {
        Self {
            identity: IdentitySource::default(),
            timezone_marker: DEFAULT_TIMEZONE_MARKER.to_string(),
        }
    }
}

/// Parse a submission timestamp after dropping the trailing timezone marker.
pub fn parse_submission_timestamp(raw: &str, marker: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    let stripped = if marker.trim().is_empty() {
        trimmed
    } else {
        trimmed.strip_suffix(marker).unwrap_or(trimmed).trim_end()
    };
    NaiveDateTime::parse_from_str(stripped, TIMESTAMP_FORMAT).ok()
}

pub fn join_answers(values: &[AnswerValue]) -> String {
    values
        .iter()
        .filter_map(AnswerValue::resolved_text)
        .collect::<Vec<_>>()
        .join(ANSWER_SEPARATOR)
}

fn is_reserved_column(code: &str) -> bool {
    code == RESPONSE_ID_COLUMN || code == TIMESTAMP_COLUMN
}

/// Flatten responses into one wide row each.
///
/// Columns are the union of question codes across the whole batch, in
/// first-seen order, including codes only seen on rows that fail to parse.
pub fn flatten(responses: &[RawResponse], options: &FlattenOptions) -> RowSet {
    let mut stats = FlattenStats {
        responses: responses.len(),
        ..Default::default()
    };
    let mut question_codes: Vec<String> = Vec::new();
    let mut seen_codes: HashSet<String> = HashSet::new();
    let mut answer_maps: Vec<HashMap<&str, String>> = Vec::with_capacity(responses.len());

    for response in responses {
        let mut answers = HashMap::new();
        for group in &response.response_set {
            let Some(code) = group.question_code.as_deref() else {
                stats.groups_without_code += 1;
                continue;
            };
            if is_reserved_column(code) {
                stats.reserved_codes += 1;
                continue;
            }
            if seen_codes.insert(code.to_string()) {
                question_codes.push(code.to_string());
            }
            answers.insert(code, join_answers(&group.answer_values));
        }
        answer_maps.push(answers);
    }

    let mut rows = Vec::with_capacity(responses.len());
    for (response, mut answers) in responses.iter().zip(answer_maps) {
        let raw_timestamp = response.timestamp.as_deref().unwrap_or_default();
        let Some(submitted_at) = parse_submission_timestamp(raw_timestamp, &options.timezone_marker)
        else {
            debug!(timestamp = %raw_timestamp, "dropping response with unparsable timestamp");
            stats.dropped_unparsable += 1;
            continue;
        };

        let response_id = response.response_id_text();
        let key = match options.identity {
            IdentitySource::Timestamp => timestamp_key(&submitted_at),
            IdentitySource::ResponseId => match &response_id {
                Some(id) => id.clone(),
                None => {
                    debug!(timestamp = %raw_timestamp, "dropping response without responseID");
                    stats.dropped_unparsable += 1;
                    continue;
                }
            },
        };

        let row_answers = question_codes
            .iter()
            .map(|code| answers.remove(code.as_str()).unwrap_or_default())
            .collect();

        rows.push(FlatRow {
            key,
            response_id,
            submitted_at,
            answers: row_answers,
        });
    }

    info!(
        rows = rows.len(),
        columns = question_codes.len() + 2,
        dropped = stats.dropped_unparsable,
        "flattened responses"
    );

    RowSet {
        identity: options.identity,
        question_codes,
        rows,
        stats,
    }
}
