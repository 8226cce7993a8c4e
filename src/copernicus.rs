use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::Credentials;
use crate::domain::{AuthToken, CatalogRecord, dedup_by_id, parse_catalog_page};
use crate::error::IngestError;

const MAX_PAGES: usize = 50;
const CLIENT_ID: &str = "cdse-public";

pub trait CatalogSearch: Send + Sync {
    fn search(&self, aoi_wkt: &str, collection: &str) -> Result<Vec<CatalogRecord>, IngestError>;
}

pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Result<AuthToken, IngestError>;
}

fn build_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    let mut headers = HeaderMap::new();
    if let Ok(agent) = HeaderValue::from_str(&format!("safe-ingest/{}", env!("CARGO_PKG_VERSION")))
    {
        headers.insert(USER_AGENT, agent);
    }
    Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()
}

pub fn catalog_filter(collection: &str, aoi_wkt: &str) -> String {
    format!(
        "Collection/Name eq '{collection}' and OData.CSC.Intersects(area=geography'SRID=4326;{}')",
        aoi_wkt.trim()
    )
}

#[derive(Clone)]
pub struct CopernicusCatalogClient {
    client: Client,
    base_url: String,
}

impl CopernicusCatalogClient {
    pub fn new(base_url: &str) -> Result<Self, IngestError> {
        let client = build_client(Duration::from_secs(60))
            .map_err(|err| IngestError::CatalogHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn products_url(&self) -> String {
        format!("{}/odata/v1/Products", self.base_url)
    }

    fn handle_status(response: Response) -> Result<Response, IngestError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "catalog request failed".to_string());
        Err(IngestError::CatalogStatus { status, message })
    }

    fn fetch_page(&self, request: reqwest::blocking::RequestBuilder) -> Result<Value, IngestError> {
        let response = request
            .send()
            .map_err(|err| IngestError::CatalogHttp(err.to_string()))?;
        Self::handle_status(response)?
            .json::<Value>()
            .map_err(|err| IngestError::CatalogHttp(err.to_string()))
    }
}

impl CatalogSearch for CopernicusCatalogClient {
    fn search(&self, aoi_wkt: &str, collection: &str) -> Result<Vec<CatalogRecord>, IngestError> {
        let filter = catalog_filter(collection, aoi_wkt);
        let first = self.fetch_page(
            self.client
                .get(self.products_url())
                .query(&[("$filter", filter.as_str())]),
        )?;
        let (records, pages) =
            collect_pages(first, |next| self.fetch_page(self.client.get(next)))?;
        info!(collection, records = records.len(), pages, "catalog search finished");
        Ok(records)
    }
}

/// Follows `@odata.nextLink` from the first page. A failing follow-up page
/// ends pagination but keeps what was already collected.
pub fn collect_pages(
    first: Value,
    mut fetch_next: impl FnMut(&str) -> Result<Value, IngestError>,
) -> Result<(Vec<CatalogRecord>, usize), IngestError> {
    let mut records = parse_catalog_page(&first)?;
    let mut next = next_link(&first);
    let mut pages = 1;
    while let Some(link) = next.take() {
        if pages >= MAX_PAGES {
            warn!(pages, "catalog pagination limit reached, remaining pages skipped");
            break;
        }
        let (page, link) = match fetch_next(&link).and_then(|body| {
            parse_catalog_page(&body).map(|records| (records, next_link(&body)))
        }) {
            Ok(page) => page,
            Err(err) => {
                warn!(
                    pages,
                    kept = records.len(),
                    error = %err,
                    "catalog page failed, keeping earlier pages"
                );
                break;
            }
        };
        records.extend(page);
        next = link;
        pages += 1;
    }
    Ok((records, pages))
}

fn next_link(body: &Value) -> Option<String> {
    body.get("@odata.nextLink")
        .and_then(Value::as_str)
        .map(str::to_string)
}

pub fn search_polygons(
    search: &dyn CatalogSearch,
    polygons: &[String],
    collection: &str,
) -> Vec<CatalogRecord> {
    let mut all = Vec::new();
    for (index, wkt) in polygons.iter().enumerate() {
        match search.search(wkt, collection) {
            Ok(records) => {
                info!(polygon = index, records = records.len(), "catalog records for polygon");
                all.extend(records);
            }
            Err(err) => {
                error!(polygon = index, wkt = %wkt, error = %err, "catalog search failed for polygon");
            }
        }
    }
    let unique = dedup_by_id(all);
    if unique.is_empty() {
        warn!("no catalog records found for any polygon");
    }
    unique
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

pub struct CdseTokenClient {
    client: Client,
    token_url: String,
    credentials: Credentials,
}

impl CdseTokenClient {
    pub fn new(token_url: &str, credentials: Credentials) -> Result<Self, IngestError> {
        let client = build_client(Duration::from_secs(30))
            .map_err(|err| IngestError::AuthHttp(err.to_string()))?;
        Ok(Self {
            client,
            token_url: token_url.to_string(),
            credentials,
        })
    }
}

impl TokenProvider for CdseTokenClient {
    fn token(&self) -> Result<AuthToken, IngestError> {
        let form = [
            ("client_id", CLIENT_ID),
            ("username", self.credentials.username.as_str()),
            ("password", self.credentials.password.as_str()),
            ("grant_type", "password"),
        ];
        let response = self
            .client
            .post(&self.token_url)
            .form(&form)
            .send()
            .map_err(|err| IngestError::AuthHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "token request failed".to_string());
            return Err(IngestError::AuthStatus { status, message });
        }
        let body: TokenResponse = response
            .json()
            .map_err(|err| IngestError::AuthHttp(err.to_string()))?;
        info!(username = %self.credentials.username, "obtained download token");
        Ok(AuthToken::new(body.access_token))
    }
}
