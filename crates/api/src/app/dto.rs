use serde::Deserialize;

use bulkmsg_core::{DomainError, JobId, SenderId};
use bulkmsg_infra::job_store::{PageRequest, DEFAULT_PAGE_SIZE};
use bulkmsg_messaging::{BodyFormat, MessagePayload, RecipientSelection};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub body_format: BodyFormat,
    pub sender_id: SenderId,
    pub selection: RecipientSelection,
    pub filter_description: Option<String>,
}

impl CreateJobRequest {
    pub fn payload(&self) -> Result<MessagePayload, DomainError> {
        MessagePayload::new(self.subject.as_str(), self.body.as_str(), self.body_format)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

impl HistoryQuery {
    pub fn page_request(&self) -> PageRequest {
        PageRequest::new(
            self.page.unwrap_or(0),
            self.per_page.unwrap_or(DEFAULT_PAGE_SIZE),
        )
    }
}

// -------------------------
// Path parsing
// -------------------------

pub fn parse_job_id(raw: &str) -> Result<JobId, axum::response::Response> {
    raw.parse().map_err(|e: DomainError| {
        errors::json_error(axum::http::StatusCode::BAD_REQUEST, "invalid_id", e.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulkmsg_core::RecipientId;

    #[test]
    fn create_request_defaults_to_html() {
        let body = serde_json::json!({
            "subject": "Exam timetable",
            "body": "<p>See attached</p>",
            "sender_id": SenderId::new(),
            "selection": { "kind": "list", "value": [3, 1, 3] },
        });

        let request: CreateJobRequest = serde_json::from_value(body).unwrap();
        assert_eq!(request.body_format, BodyFormat::Html);
        assert_eq!(
            request.selection,
            RecipientSelection::List(vec![RecipientId::new(3), RecipientId::new(1), RecipientId::new(3)])
        );
        assert!(request.filter_description.is_none());
        assert!(request.payload().is_ok());
    }

    #[test]
    fn selection_all_needs_no_value() {
        let selection: RecipientSelection = serde_json::from_value(serde_json::json!({ "kind": "all" })).unwrap();
        assert_eq!(selection, RecipientSelection::All);
    }

    #[test]
    fn history_query_defaults_and_clamps() {
        assert_eq!(HistoryQuery::default().page_request(), PageRequest::default());

        let query = HistoryQuery {
            page: Some(2),
            per_page: Some(10_000),
        };
        let page = query.page_request();
        assert_eq!(page.page, 2);
        assert!(page.per_page <= bulkmsg_infra::job_store::MAX_PAGE_SIZE);
    }

    #[test]
    fn rejects_malformed_job_id() {
        assert!(parse_job_id("not-a-uuid").is_err());
        assert!(parse_job_id(&JobId::new().to_string()).is_ok());
    }
}
