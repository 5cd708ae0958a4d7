use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;
use shelfmark_core::CatalogSource;
use shelfmark_core::config::CatalogsConfig;
use tracing::warn;

use crate::error::{CatalogError, Result};
use crate::http::{CatalogClient, endpoint};
use crate::sources::{CatalogAdapter, RawRecord, str_array, str_field, u64_field};

const SOURCE: CatalogSource = CatalogSource::GoogleBooks;
/// The volumes endpoint rejects `maxResults` above this.
const MAX_RESULTS: usize = 40;
/// `imageLinks` keys, largest first.
const IMAGE_SIZES: [&str; 6] = ["extraLarge", "large", "medium", "small", "thumbnail", "smallThumbnail"];

/// The commercial volume catalog.
pub struct GoogleBooksAdapter {
    client: CatalogClient,
    base_url: String,
    api_key: Option<String>,
}

impl GoogleBooksAdapter {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self> {
        Ok(Self {
            client: CatalogClient::new(SOURCE, timeout, max_retries)?,
            base_url: base_url.into(),
            api_key,
        })
    }

    pub fn from_config(config: &CatalogsConfig) -> Result<Self> {
        Self::new(
            config.google_books_url.clone(),
            config.google_books_api_key.clone(),
            Duration::from_secs(config.request_timeout_secs),
            config.max_retries,
        )
    }

    async fn query_volumes(&self, q: &str, limit: usize) -> Result<Vec<RawRecord>> {
        let mut url = self.url(&["volumes"])?;
        url.query_pairs_mut()
            .append_pair("q", q)
            .append_pair("maxResults", &limit.clamp(1, MAX_RESULTS).to_string());
        self.with_key(&mut url);

        let body = self.client.get_json(&url).await?;
        // `items` is omitted entirely when nothing matches.
        let Some(items) = body.get("items") else {
            return Ok(Vec::new());
        };
        let items = items
            .as_array()
            .ok_or_else(|| CatalogError::malformed(SOURCE, "items is not an array"))?;

        Ok(items
            .iter()
            .filter_map(|item| match volume_from_json(item) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(error = %e, "skipping volume");
                    None
                }
            })
            .collect())
    }

    fn with_key(&self, url: &mut Url) {
        if let Some(key) = &self.api_key {
            url.query_pairs_mut().append_pair("key", key);
        }
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        endpoint(SOURCE, &self.base_url, segments)
    }
}

#[async_trait]
impl CatalogAdapter for GoogleBooksAdapter {
    fn source(&self) -> CatalogSource {
        SOURCE
    }

    async fn search(&self, query: &str, limit: usize, author: Option<&str>) -> Result<Vec<RawRecord>> {
        let mut q = format!("intitle:{}", query.trim());
        if let Some(author) = author {
            q.push_str(&format!(" inauthor:{}", author.trim()));
        }
        self.query_volumes(&q, limit).await
    }

    async fn get_by_identity(&self, key: &str) -> Result<Option<RawRecord>> {
        let mut url = self.url(&["volumes", key])?;
        self.with_key(&mut url);
        match self.client.get_entity(&url).await? {
            Some(body) => volume_from_json(&body).map(Some),
            None => Ok(None),
        }
    }

    async fn search_by_isbn(&self, isbn: &str) -> Result<Option<RawRecord>> {
        Ok(self
            .query_volumes(&format!("isbn:{isbn}"), 1)
            .await?
            .into_iter()
            .next())
    }
}

fn volume_from_json(item: &Value) -> Result<RawRecord> {
    let id = str_field(item, "id").ok_or_else(|| CatalogError::malformed(SOURCE, "volume without id"))?;
    let info = item
        .get("volumeInfo")
        .ok_or_else(|| CatalogError::malformed(SOURCE, format!("volume {id} without volumeInfo")))?;
    let title = str_field(info, "title")
        .ok_or_else(|| CatalogError::malformed(SOURCE, format!("volume {id} without title")))?;

    let mut record = RawRecord::new(SOURCE);
    record.catalog_key = Some(id);
    record.title = Some(title);
    record.authors = str_array(info, "authors");
    record.isbns = industry_isbns(info);
    record.publisher = str_field(info, "publisher");
    record.published_date = str_field(info, "publishedDate");
    record.description = str_field(info, "description");
    record.page_count = u64_field(info, "pageCount")
        .filter(|n| *n > 0)
        .and_then(|n| u32::try_from(n).ok());
    record.image_url = largest_image(info);
    record.subjects = str_array(info, "categories");
    record.language = str_field(info, "language");
    record.ratings_average = info.get("averageRating").and_then(Value::as_f64);
    record.ratings_count = u64_field(info, "ratingsCount").and_then(|n| u32::try_from(n).ok());
    Ok(record)
}

/// `[{"type": "ISBN_13", "identifier": ...}]`, ISBN-13 entries first.
/// Other identifier types (`OTHER`, `ISSN`) are dropped.
fn industry_isbns(info: &Value) -> Vec<String> {
    let Some(ids) = info.get("industryIdentifiers").and_then(Value::as_array) else {
        return Vec::new();
    };
    let of_type = |kind: &str| {
        ids.iter()
            .filter(|id| id.get("type").and_then(Value::as_str) == Some(kind))
            .filter_map(|id| str_field(id, "identifier"))
            .collect::<Vec<_>>()
    };
    let mut isbns = of_type("ISBN_13");
    isbns.extend(of_type("ISBN_10"));
    isbns
}

fn largest_image(info: &Value) -> Option<String> {
    let links = info.get("imageLinks")?;
    IMAGE_SIZES
        .iter()
        .find_map(|size| str_field(links, size))
        .map(|url| match url.strip_prefix("http://") {
            Some(rest) => format!("https://{rest}"),
            None => url,
        })
}
