use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use shelfmark_core::CatalogSource;
use shelfmark_core::config::CatalogsConfig;
use tracing::{debug, warn};

use crate::error::{CatalogError, Result};
use crate::http::{CatalogClient, endpoint};
use crate::sources::{CatalogAdapter, Engagement, RawRecord, str_array, str_field, u64_field};

const SOURCE: CatalogSource = CatalogSource::OpenLibrary;
const SEARCH_FIELDS: &str = "key,title,author_name,isbn,publisher,first_publish_year,cover_i,\
cover_edition_key,edition_count,subject,language,number_of_pages_median,ratings_average,\
ratings_count,already_read_count,currently_reading_count,want_to_read_count";
const EDITIONS_PAGE: usize = 50;

/// The works catalog: search index, work detail, editions, authors.
pub struct OpenLibraryAdapter {
    client: CatalogClient,
    base_url: String,
}

impl OpenLibraryAdapter {
    pub fn new(base_url: impl Into<String>, timeout: Duration, max_retries: u32) -> Result<Self> {
        Ok(Self {
            client: CatalogClient::new(SOURCE, timeout, max_retries)?,
            base_url: base_url.into(),
        })
    }

    pub fn from_config(config: &CatalogsConfig) -> Result<Self> {
        Self::new(
            config.open_library_url.clone(),
            Duration::from_secs(config.request_timeout_secs),
            config.max_retries,
        )
    }

    /// Work detail merged with its best edition, which is where ISBNs, page
    /// counts and publishers live.
    pub async fn resolve_work(&self, work_key: &str) -> Result<Option<RawRecord>> {
        let (work, edition) = futures::join!(self.work_detail(work_key), self.best_edition(work_key));
        let Some(mut record) = work? else {
            return Ok(None);
        };
        match edition {
            Ok(Some(edition)) => merge_edition(&mut record, edition),
            Ok(None) => {}
            Err(e) => warn!(work_key, error = %e, "edition listing failed, using work only"),
        }
        Ok(Some(record))
    }

    /// Highest [`edition_score`] among the work's editions; ties keep catalog order.
    pub async fn best_edition(&self, work_key: &str) -> Result<Option<RawRecord>> {
        let key = bare_key(work_key);
        let mut url = self.url(&["works", key, "editions.json"])?;
        url.query_pairs_mut()
            .append_pair("limit", &EDITIONS_PAGE.to_string());
        let Some(body) = self.client.get_entity(&url).await? else {
            return Ok(None);
        };
        let entries = body
            .get("entries")
            .and_then(Value::as_array)
            .ok_or_else(|| CatalogError::malformed(SOURCE, "editions response has no entries"))?;

        let mut best: Option<(u32, &Value)> = None;
        for entry in entries {
            let score = edition_score(entry);
            if best.is_none_or(|(top, _)| score > top) {
                best = Some((score, entry));
            }
        }
        Ok(best.map(|(_, entry)| edition_from_json(entry)))
    }

    async fn work_detail(&self, work_key: &str) -> Result<Option<RawRecord>> {
        let key = bare_key(work_key);
        let url = self.url(&["works", &format!("{key}.json")])?;
        let Some(body) = self.client.get_entity(&url).await? else {
            return Ok(None);
        };

        let mut record = RawRecord::new(SOURCE);
        record.catalog_key = Some(key.to_string());
        record.title = str_field(&body, "title");
        record.description = text_value(body.get("description"));
        record.subjects = str_array(&body, "subjects");
        record.cover_id = first_cover(&body);
        record.published_date = str_field(&body, "first_publish_date");
        record.authors = self.author_names(&author_keys(&body)).await;
        Ok(Some(record))
    }

    /// Resolve author references concurrently; a failed lookup drops that name.
    async fn author_names(&self, keys: &[String]) -> Vec<String> {
        let fetches = keys.iter().map(|key| async move {
            let url = self.url(&["authors", &format!("{key}.json")]).ok()?;
            match self.client.get_entity(&url).await {
                Ok(Some(author)) => str_field(&author, "name"),
                Ok(None) => None,
                Err(e) => {
                    debug!(author = %key, error = %e, "author lookup failed");
                    None
                }
            }
        });
        join_all(fetches).await.into_iter().flatten().collect()
    }

    fn url(&self, segments: &[&str]) -> Result<reqwest::Url> {
        endpoint(SOURCE, &self.base_url, segments)
    }
}

#[async_trait]
impl CatalogAdapter for OpenLibraryAdapter {
    fn source(&self) -> CatalogSource {
        SOURCE
    }

    async fn search(&self, query: &str, limit: usize, author: Option<&str>) -> Result<Vec<RawRecord>> {
        let mut url = self.url(&["search.json"])?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("q", query)
                .append_pair("limit", &limit.to_string())
                .append_pair("fields", SEARCH_FIELDS);
            if let Some(author) = author {
                pairs.append_pair("author", author);
            }
        }

        let body = self.client.get_json(&url).await?;
        let docs = body
            .get("docs")
            .and_then(Value::as_array)
            .ok_or_else(|| CatalogError::malformed(SOURCE, "search response has no docs"))?;

        Ok(docs
            .iter()
            .filter_map(|doc| match search_doc_from_json(doc) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(error = %e, "skipping search doc");
                    None
                }
            })
            .collect())
    }

    async fn get_by_identity(&self, key: &str) -> Result<Option<RawRecord>> {
        self.resolve_work(key).await
    }

    async fn search_by_isbn(&self, isbn: &str) -> Result<Option<RawRecord>> {
        let url = self.url(&["isbn", &format!("{isbn}.json")])?;
        let Some(body) = self.client.get_entity(&url).await? else {
            return Ok(None);
        };
        let mut record = edition_from_json(&body);
        if record.title.is_none() {
            return Err(CatalogError::malformed(SOURCE, format!("edition for {isbn} has no title")));
        }
        record.catalog_key = body
            .get("works")
            .and_then(Value::as_array)
            .and_then(|works| works.first())
            .and_then(|w| str_field(w, "key"))
            .map(|k| bare_key(&k).to_string());
        record.authors = self.author_names(&author_keys(&body)).await;
        Ok(Some(record))
    }
}

/// Point rule for picking an edition: ISBN-13 +10, ISBN-10 +5, page count +5,
/// cover +5, English +3, publisher +2.
pub fn edition_score(edition: &Value) -> u32 {
    let mut score = 0;
    if !str_array(edition, "isbn_13").is_empty() {
        score += 10;
    }
    if !str_array(edition, "isbn_10").is_empty() {
        score += 5;
    }
    if u64_field(edition, "number_of_pages").is_some_and(|n| n > 0) {
        score += 5;
    }
    if first_cover(edition).is_some() {
        score += 5;
    }
    if language_codes(edition).iter().any(|l| l == "eng") {
        score += 3;
    }
    if !str_array(edition, "publishers").is_empty() {
        score += 2;
    }
    score
}

fn search_doc_from_json(doc: &Value) -> Result<RawRecord> {
    let key = str_field(doc, "key")
        .ok_or_else(|| CatalogError::malformed(SOURCE, "search doc without key"))?;
    let title = str_field(doc, "title")
        .ok_or_else(|| CatalogError::malformed(SOURCE, format!("search doc {key} without title")))?;

    let mut record = RawRecord::new(SOURCE);
    record.catalog_key = Some(bare_key(&key).to_string());
    record.edition_key = str_field(doc, "cover_edition_key");
    record.title = Some(title);
    record.authors = str_array(doc, "author_name");
    record.isbns = str_array(doc, "isbn");
    record.publisher = str_array(doc, "publisher").into_iter().next();
    record.published_date = u64_field(doc, "first_publish_year").map(|y| y.to_string());
    record.page_count = u64_field(doc, "number_of_pages_median").and_then(|n| u32::try_from(n).ok());
    record.cover_id = doc.get("cover_i").and_then(Value::as_i64).filter(|id| *id > 0);
    record.subjects = str_array(doc, "subject");
    record.language = str_array(doc, "language").into_iter().next();
    record.ratings_average = doc.get("ratings_average").and_then(Value::as_f64);
    record.ratings_count = u64_field(doc, "ratings_count").and_then(|n| u32::try_from(n).ok());
    record.engagement = Engagement {
        edition_count: u64_field(doc, "edition_count"),
        already_read: u64_field(doc, "already_read_count"),
        currently_reading: u64_field(doc, "currently_reading_count"),
        want_to_read: u64_field(doc, "want_to_read_count"),
        ratings_count: u64_field(doc, "ratings_count"),
    };
    Ok(record)
}

fn edition_from_json(edition: &Value) -> RawRecord {
    let mut record = RawRecord::new(SOURCE);
    record.edition_key = str_field(edition, "key").map(|k| bare_key(&k).to_string());
    record.title = str_field(edition, "title");
    record.isbns = str_array(edition, "isbn_13");
    record.isbns.extend(str_array(edition, "isbn_10"));
    record.publisher = str_array(edition, "publishers").into_iter().next();
    record.published_date = str_field(edition, "publish_date");
    record.page_count = u64_field(edition, "number_of_pages").and_then(|n| u32::try_from(n).ok());
    record.cover_id = first_cover(edition);
    record.language = language_codes(edition).into_iter().next();
    record.description = text_value(edition.get("description"));
    record.subjects = str_array(edition, "subjects");
    record
}

/// Edition data fills only what the work left empty.
fn merge_edition(work: &mut RawRecord, edition: RawRecord) {
    if work.isbns.is_empty() {
        work.isbns = edition.isbns;
    }
    work.edition_key = work.edition_key.take().or(edition.edition_key);
    work.publisher = work.publisher.take().or(edition.publisher);
    work.published_date = work.published_date.take().or(edition.published_date);
    work.page_count = work.page_count.or(edition.page_count);
    work.cover_id = work.cover_id.or(edition.cover_id);
    work.language = work.language.take().or(edition.language);
    work.description = work.description.take().or(edition.description);
    if work.subjects.is_empty() {
        work.subjects = edition.subjects;
    }
}

/// `"/works/OL45804W"` → `"OL45804W"`.
fn bare_key(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Descriptions arrive either as a plain string or as `{"type": ..., "value": ...}`.
fn text_value(v: Option<&Value>) -> Option<String> {
    let text = match v? {
        Value::String(s) => s.as_str(),
        Value::Object(obj) => obj.get("value")?.as_str()?,
        _ => return None,
    };
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Cover ids of -1 mark deleted covers.
fn first_cover(v: &Value) -> Option<i64> {
    v.get("covers")
        .and_then(Value::as_array)?
        .iter()
        .filter_map(Value::as_i64)
        .find(|id| *id > 0)
}

/// Work-level and edition-level author references use different shapes:
/// `[{"author": {"key": ...}}]` and `[{"key": ...}]`.
fn author_keys(v: &Value) -> Vec<String> {
    v.get("authors")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|a| a.get("author").unwrap_or(a).get("key").and_then(Value::as_str))
                .map(|k| bare_key(k).to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// `[{"key": "/languages/eng"}]` → `["eng"]`.
fn language_codes(v: &Value) -> Vec<String> {
    v.get("languages")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|l| l.get("key").and_then(Value::as_str))
                .map(|k| bare_key(k).to_string())
                .collect()
        })
        .unwrap_or_default()
}
