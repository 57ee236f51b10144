//! Job sources described by data instead of code.
//!
//! A [`SourceDefinition`] is a JSON document holding a search URL template
//! and CSS selectors for the listing and detail pages. [`SelectorSource`]
//! compiles it once and implements [`JobSource`] on top of `scraper`.
//!
//! Selectors read an element's text by default; `css@attr` reads an
//! attribute instead (`time.posted@datetime`, `a.job@href`).

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use trawl_core::util::derive_source_name;
use trawl_core::{
    AppError, Filters, JobQuery, JobRecord, JobSource, ListingPage, RateLimitConfig, compute_hash,
};
use url::Url;
use url::form_urlencoded::byte_serialize;

use crate::cleaner::DescriptionCleaner;
use crate::salary::parse_salary;

const JOB_ID_HASH_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceDefinition {
    /// Source name; defaults to the definition file's stem.
    #[serde(default)]
    pub name: String,
    /// Listing URL template. Placeholders: `{query}`, `{location}`,
    /// `{page}` (page number counted from `first_page`) and `{offset}`
    /// (`page * page_size`).
    pub search_url: String,
    #[serde(default)]
    pub first_page: usize,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    /// Filters always sent to this source; per-run filters override them.
    #[serde(default)]
    pub filters: Filters,
    pub listing: ListingSelectors,
    pub detail: DetailSelectors,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

fn default_max_pages() -> usize {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListingSelectors {
    /// Links to detail pages; reads `href` unless an attribute is given.
    pub job_link: String,
    #[serde(default)]
    pub next_page: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetailSelectors {
    pub title: String,
    pub company: String,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    /// Element whose inner HTML becomes the Markdown description.
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub salary: Option<String>,
    #[serde(default)]
    pub employment_type: Option<String>,
    #[serde(default)]
    pub posted_at: Option<String>,
}

impl SourceDefinition {
    pub fn from_json(json: &str) -> Result<Self, AppError> {
        serde_json::from_str(json)
            .map_err(|e| AppError::Config(format!("Invalid source definition: {e}")))
    }

    /// Read a definition file. A missing `name` is filled from the file stem.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Cannot read source definition {}: {e}", path.display()))
        })?;
        let mut definition = Self::from_json(&raw)
            .map_err(|e| AppError::Config(format!("{}: {e}", path.display())))?;
        if definition.name.trim().is_empty() {
            definition.name = derive_source_name(path);
        }
        Ok(definition)
    }

    /// Check the definition without building a source from it.
    pub fn validate(&self) -> Result<(), AppError> {
        SelectorSource::new(self.clone()).map(|_| ())
    }
}

/// A CSS selector plus the attribute to read, if any.
#[derive(Debug, Clone)]
struct Field {
    raw: String,
    selector: Selector,
    attr: Option<String>,
}

impl Field {
    fn parse(label: &str, raw: &str, default_attr: Option<&str>) -> Result<Self, AppError> {
        let (css, attr) = match raw.rsplit_once('@') {
            Some((css, attr)) if is_attr_name(attr) => (css.trim(), Some(attr.trim().to_string())),
            _ => (raw.trim(), default_attr.map(str::to_string)),
        };
        if css.is_empty() {
            return Err(AppError::Config(format!("Empty {label} selector")));
        }
        let selector = Selector::parse(css)
            .map_err(|e| AppError::Config(format!("Invalid {label} selector '{raw}': {e}")))?;
        Ok(Self {
            raw: raw.to_string(),
            selector,
            attr,
        })
    }

    fn optional(label: &str, raw: Option<&str>) -> Result<Option<Self>, AppError> {
        raw.map(|raw| Self::parse(label, raw, None)).transpose()
    }

    fn read(&self, element: ElementRef<'_>) -> Option<String> {
        let value = match &self.attr {
            Some(attr) => element.value().attr(attr)?.trim().to_string(),
            None => collapse_whitespace(element.text()),
        };
        (!value.is_empty()).then_some(value)
    }

    fn first(&self, doc: &Html) -> Option<String> {
        doc.select(&self.selector).find_map(|el| self.read(el))
    }

    fn all(&self, doc: &Html) -> Vec<String> {
        doc.select(&self.selector).filter_map(|el| self.read(el)).collect()
    }

    fn first_html(&self, doc: &Html) -> Option<String> {
        doc.select(&self.selector)
            .next()
            .map(|el| el.inner_html())
            .filter(|html| !html.trim().is_empty())
    }
}

fn is_attr_name(attr: &str) -> bool {
    let attr = attr.trim();
    !attr.is_empty()
        && attr
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ':')
}

fn collapse_whitespace<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    parts
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

struct DetailFields {
    title: Field,
    company: Field,
    job_id: Option<Field>,
    location: Option<Field>,
    description: Option<Field>,
    salary: Option<Field>,
    employment_type: Option<Field>,
    posted_at: Option<Field>,
}

/// [`JobSource`] driven by a [`SourceDefinition`].
pub struct SelectorSource {
    definition: SourceDefinition,
    job_link: Field,
    next_page: Option<Field>,
    detail: DetailFields,
    cleaner: DescriptionCleaner,
}

impl SelectorSource {
    /// Compile the definition's selectors and check its URL template.
    pub fn new(definition: SourceDefinition) -> Result<Self, AppError> {
        if definition.name.trim().is_empty() {
            return Err(AppError::Config("Source definition has no name".into()));
        }
        if !definition.search_url.contains("{query}") {
            return Err(AppError::Config(format!(
                "{}: search_url must contain a {{query}} placeholder",
                definition.name
            )));
        }
        if definition.max_pages == 0 {
            return Err(AppError::Config(format!(
                "{}: max_pages must be at least 1",
                definition.name
            )));
        }

        let listing = &definition.listing;
        let detail = &definition.detail;
        let source = Self {
            job_link: Field::parse("job_link", &listing.job_link, Some("href"))?,
            next_page: listing
                .next_page
                .as_deref()
                .map(|raw| Field::parse("next_page", raw, Some("href")))
                .transpose()?,
            detail: DetailFields {
                title: Field::parse("title", &detail.title, None)?,
                company: Field::parse("company", &detail.company, None)?,
                job_id: Field::optional("job_id", detail.job_id.as_deref())?,
                location: Field::optional("location", detail.location.as_deref())?,
                description: Field::optional("description", detail.description.as_deref())?,
                salary: Field::optional("salary", detail.salary.as_deref())?,
                employment_type: Field::optional(
                    "employment_type",
                    detail.employment_type.as_deref(),
                )?,
                posted_at: Field::optional("posted_at", detail.posted_at.as_deref())?,
            },
            cleaner: DescriptionCleaner::new(),
            definition,
        };

        // Render a sample URL so template mistakes surface at load time.
        source.listing_url(&JobQuery::new("sample"), &Filters::new(), 0, None)?;
        Ok(source)
    }

    pub fn definition(&self) -> &SourceDefinition {
        &self.definition
    }

    pub fn rate_limit(&self) -> Option<&RateLimitConfig> {
        self.definition.rate_limit.as_ref()
    }

    fn render_template(&self, query: &JobQuery, page: usize) -> String {
        let page_number = self.definition.first_page.saturating_add(page);
        let offset = page.saturating_mul(self.definition.page_size.unwrap_or(0));
        self.definition
            .search_url
            .replace("{query}", &encode(&query.query))
            .replace("{location}", &encode(query.location.as_deref().unwrap_or("")))
            .replace("{page}", &page_number.to_string())
            .replace("{offset}", &offset.to_string())
    }
}

impl std::fmt::Debug for SelectorSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectorSource")
            .field("name", &self.definition.name)
            .field("search_url", &self.definition.search_url)
            .finish_non_exhaustive()
    }
}

impl JobSource for SelectorSource {
    fn name(&self) -> &str {
        &self.definition.name
    }

    fn listing_url(
        &self,
        query: &JobQuery,
        filters: &Filters,
        page: usize,
        cursor: Option<&str>,
    ) -> Result<String, AppError> {
        // Next-page links already carry the site's own query string.
        if let Some(cursor) = cursor {
            return Ok(cursor.to_string());
        }

        let rendered = self.render_template(query, page);
        let mut url = Url::parse(&rendered).map_err(|e| {
            AppError::Config(format!(
                "{}: search_url renders to invalid URL '{rendered}': {e}",
                self.definition.name
            ))
        })?;

        let mut merged = self.definition.filters.clone();
        merged.extend(filters.iter().map(|(k, v)| (k.clone(), v.clone())));
        if !merged.is_empty() {
            url.query_pairs_mut().extend_pairs(merged.iter());
        }
        Ok(url.into())
    }

    fn parse_listing(&self, html: &str, page_url: &str) -> Result<ListingPage, AppError> {
        let base = Url::parse(page_url)
            .map_err(|e| AppError::Parsing(format!("Invalid page URL '{page_url}': {e}")))?;
        let doc = Html::parse_document(html);

        let mut seen = HashSet::new();
        let job_urls = self
            .job_link
            .all(&doc)
            .iter()
            .filter_map(|href| absolutize(&base, href))
            .filter(|url| seen.insert(url.clone()))
            .collect();

        let next_cursor = self
            .next_page
            .as_ref()
            .and_then(|field| field.first(&doc))
            .and_then(|href| absolutize(&base, &href))
            .filter(|next| next.as_str() != base.as_str());

        Ok(ListingPage {
            job_urls,
            next_cursor,
        })
    }

    fn parse_detail(&self, html: &str, url: &str) -> Result<JobRecord, AppError> {
        let doc = Html::parse_document(html);
        let fields = &self.detail;

        let required = |field: &Field, what: &str| {
            field.first(&doc).ok_or_else(|| {
                AppError::Parsing(format!("No {what} matching '{}' at {url}", field.raw))
            })
        };
        let title = required(&fields.title, "title")?;
        let company = required(&fields.company, "company")?;

        let job_id = fields
            .job_id
            .as_ref()
            .and_then(|f| f.first(&doc))
            .unwrap_or_else(|| compute_hash(url)[..JOB_ID_HASH_LEN].to_string());

        let mut record = JobRecord::new(job_id, title, company, url);

        if let Some(location) = fields.location.as_ref().and_then(|f| f.first(&doc)) {
            record = record.with_location(location);
        }
        if let Some(fragment) = fields.description.as_ref().and_then(|f| f.first_html(&doc)) {
            match self.cleaner.clean(&fragment) {
                Ok(markdown) if !markdown.is_empty() => record = record.with_description(markdown),
                Ok(_) => {}
                Err(e) => tracing::warn!(source = %self.definition.name, %url, error = %e, "Description dropped"),
            }
        }
        if let Some(salary) = fields
            .salary
            .as_ref()
            .and_then(|f| f.first(&doc))
            .and_then(|text| parse_salary(&text))
        {
            record = record.with_salary(salary);
        }
        if let Some(kind) = fields.employment_type.as_ref().and_then(|f| f.first(&doc)) {
            record = record.with_employment_type(kind);
        }
        if let Some(posted) = fields
            .posted_at
            .as_ref()
            .and_then(|f| f.first(&doc))
            .and_then(|text| parse_posted_at(&text, Utc::now()))
        {
            record = record.with_posted_at(posted);
        }

        Ok(record)
    }

    fn max_pages(&self) -> usize {
        self.definition.max_pages
    }

    /// Templates with `{page}` or `{offset}` and no next-page selector are
    /// walked by number.
    fn follows_cursor(&self) -> bool {
        let url = &self.definition.search_url;
        self.next_page.is_some() || !(url.contains("{page}") || url.contains("{offset}"))
    }
}

fn encode(value: &str) -> String {
    byte_serialize(value.as_bytes()).collect()
}

/// Resolve `href` against the page URL, keeping only web links and
/// dropping fragments.
fn absolutize(base: &Url, href: &str) -> Option<String> {
    let mut url = base.join(href.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    Some(url.into())
}

/// Understands RFC 3339, plain `YYYY-MM-DD`, and relative phrases such as
/// "today", "3 days ago" or "5 hours ago".
fn parse_posted_at(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }

    let lower = text.to_lowercase();
    if lower.contains("just now") || lower.contains("today") {
        return Some(now);
    }
    if lower.contains("yesterday") {
        return now.checked_sub_signed(TimeDelta::try_days(1)?);
    }

    // Page text is untrusted: out-of-range amounts yield `None`.
    let mut words = lower.split_whitespace();
    let amount: i64 = words.find_map(|w| w.trim_end_matches('+').parse().ok())?;
    let unit = words.next()?;
    let delta = match unit.trim_end_matches('s') {
        "minute" | "min" => TimeDelta::try_minutes(amount),
        "hour" | "hr" | "h" => TimeDelta::try_hours(amount),
        "day" | "d" => TimeDelta::try_days(amount),
        "week" | "w" => TimeDelta::try_weeks(amount),
        "month" => amount.checked_mul(30).and_then(TimeDelta::try_days),
        _ => None,
    }?;
    now.checked_sub_signed(delta)
}
