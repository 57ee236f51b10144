use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::util::normalize_key;

/// Free-form, source-specific filter map (e.g. `remote=true`, `radius=25`).
pub type Filters = BTreeMap<String, String>;

/// Compensation range as advertised by the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalaryRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// ISO currency code or symbol, when the source states one.
    pub currency: Option<String>,
    /// Pay period ("year", "hour", ...), when the source states one.
    pub period: Option<String>,
}

/// A single job posting captured from a source.
///
/// Records are immutable once built: the `with_*` methods consume and
/// return `self`, so a record handed to the orchestrator is never mutated
/// in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Source-scoped unique key.
    pub job_id: String,
    pub title: String,
    pub company: String,
    /// Canonical URL of the detail page.
    pub url: String,
    pub location: Option<String>,
    pub description: Option<String>,
    pub salary: Option<SalaryRange>,
    pub employment_type: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub scraped_at: DateTime<Utc>,
    /// Name of the source that produced the record, set at aggregation.
    pub source: Option<String>,
}

impl JobRecord {
    pub fn new(
        job_id: impl Into<String>,
        title: impl Into<String>,
        company: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            title: title.into(),
            company: company.into(),
            url: url.into(),
            location: None,
            description: None,
            salary: None,
            employment_type: None,
            posted_at: None,
            scraped_at: Utc::now(),
            source: None,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_salary(mut self, salary: SalaryRange) -> Self {
        self.salary = Some(salary);
        self
    }

    pub fn with_employment_type(mut self, employment_type: impl Into<String>) -> Self {
        self.employment_type = Some(employment_type.into());
        self
    }

    pub fn with_posted_at(mut self, posted_at: DateTime<Utc>) -> Self {
        self.posted_at = Some(posted_at);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Identity used for cross-source deduplication.
    ///
    /// Built from the normalized title and company, so the same posting
    /// syndicated on two boards collapses regardless of `job_id`.
    pub fn dedup_key(&self) -> String {
        format!("{}|{}", normalize_key(&self.title), normalize_key(&self.company))
    }
}

/// What to search for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobQuery {
    pub query: String,
    pub location: Option<String>,
    /// Maximum records to return per source.
    pub limit: usize,
}

impl JobQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            location: None,
            limit: 25,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// Result of parsing one listing (search results) page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingPage {
    /// Absolute detail-page URLs, in page order.
    pub job_urls: Vec<String>,
    /// Opaque cursor for the next page, `None` on the last page.
    pub next_cursor: Option<String>,
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
