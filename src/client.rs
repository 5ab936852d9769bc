use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder, header::RETRY_AFTER};
use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{
    common::{min_interval_for_rate, parse_retry_after, wait_for_rate_slot},
    constants::{FINNKODE_SITE_URL, USER_AGENT},
    error::LookupError,
    model::{ApiCode, SearchHit, SearchPage},
    retry::{RetryPolicy, with_backoff},
    source::{CodeSource, validate_code},
};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub hierarchy_base_url: String,
    pub search_url: String,
    pub code_system: String,
    pub api_token: Option<String>,
    pub timeout: Duration,
    pub requests_per_second: u32,
}

/// Thin client over the search and code-system endpoints.
///
/// Every request waits for a global rate slot first, so clones share one
/// request budget.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    hierarchy_base_url: String,
    search_url: String,
    code_system: String,
    api_token: Option<String>,
    next_slot: Arc<Mutex<Instant>>,
    min_interval: Duration,
}

impl ApiClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout)
            .build()
            .context("Failed creating HTTP client")?;
        Ok(Self {
            http,
            hierarchy_base_url: config.hierarchy_base_url.trim_end_matches('/').to_string(),
            search_url: config.search_url,
            code_system: config.code_system.trim().to_ascii_lowercase(),
            api_token: config.api_token.filter(|t| !t.trim().is_empty()),
            next_slot: Arc::new(Mutex::new(Instant::now())),
            min_interval: min_interval_for_rate(config.requests_per_second),
        })
    }

    pub fn code_system(&self) -> &str {
        &self.code_system
    }

    fn code_url(&self, segments: &[&str]) -> String {
        let mut url = format!("{}/{}", self.hierarchy_base_url, self.code_system);
        for segment in segments {
            url.push('/');
            url.push_str(segment);
        }
        url
    }

    async fn send_json(&self, url: &str, request: RequestBuilder) -> Result<Value, LookupError> {
        wait_for_rate_slot(&self.next_slot, self.min_interval).await;
        debug!(url, "request");

        let resp = request
            .header("Origin", FINNKODE_SITE_URL)
            .send()
            .await
            .map_err(|err| LookupError::from_reqwest(url, err))?;

        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<Value>()
                .await
                .map_err(|err| LookupError::Decode {
                    url: url.to_string(),
                    message: err.to_string(),
                });
        }

        let retry_after = parse_retry_after(resp.headers().get(RETRY_AFTER));
        let body = resp.text().await.unwrap_or_default();
        Err(LookupError::Status {
            url: url.to_string(),
            status: status.as_u16(),
            retry_after,
            body,
        })
    }

    async fn get_json(&self, url: &str) -> Result<Value, LookupError> {
        self.send_json(url, self.http.get(url)).await
    }

    /// `{base}/{system}[/{category}[/{code}]]/hierarchy`
    pub async fn hierarchy(
        &self,
        category: Option<&str>,
        code: Option<&str>,
    ) -> Result<Value, LookupError> {
        let mut segments = Vec::new();
        if let Some(category) = category {
            segments.push(validate_code(category)?);
            if let Some(code) = code {
                segments.push(validate_code(code)?);
            }
        }
        segments.push("hierarchy");
        let url = self.code_url(&segments);
        self.get_json(&url).await
    }

    pub async fn fetch_details(&self, code: &str) -> Result<ApiCode, LookupError> {
        let code = validate_code(code)?;
        let url = self.code_url(&[code]);
        let payload = self.get_json(&url).await?;
        serde_json::from_value(payload).map_err(|err| LookupError::Decode {
            url,
            message: err.to_string(),
        })
    }

    pub async fn fetch_children(&self, code: &str) -> Result<Vec<ApiCode>, LookupError> {
        let code = validate_code(code)?;
        let url = self.code_url(&[code, "children"]);
        let payload = self.get_json(&url).await?;
        parse_children_payload(&url, payload)
    }

    pub async fn search_page(
        &self,
        query: &str,
        filter_system: Option<&str>,
        page: u32,
        per_page: u32,
    ) -> Result<SearchPage, LookupError> {
        let mut body = json!({
            "query": query,
            "page": { "size": per_page, "current": page },
        });
        if let Some(system) = filter_system {
            body["filters"] = json!({ "all": [{ "oid_system": system }] });
        }

        let mut request = self.http.post(&self.search_url).json(&body);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }
        let payload = self.send_json(&self.search_url, request).await?;
        Ok(SearchPage::from_value(&payload))
    }

    /// Reads search pages from the first one until the last page, an empty
    /// page, or `max_pages`.
    pub async fn search_all(
        &self,
        query: &str,
        filter_system: Option<&str>,
        per_page: u32,
        max_pages: u32,
        policy: &RetryPolicy,
    ) -> Result<Vec<SearchHit>, LookupError> {
        let per_page = per_page.max(1);
        let mut hits = Vec::new();

        for page in 1..=max_pages.max(1) {
            let label = format!("search page {page}");
            let outcome = with_backoff(policy, &label, || {
                self.search_page(query, filter_system, page, per_page)
            })
            .await;
            let result = outcome.result?;

            let count = result.hits.len();
            info!(
                page = result.current,
                total_pages = result.total_pages,
                total_results = result.total_results,
                count,
                "fetched search page"
            );
            hits.extend(result.hits);

            if count == 0 || page >= result.total_pages {
                break;
            }
        }
        Ok(hits)
    }
}

impl CodeSource for ApiClient {
    async fn details(&self, code: &str) -> Result<ApiCode, LookupError> {
        self.fetch_details(code).await
    }

    async fn children(&self, code: &str) -> Result<Vec<ApiCode>, LookupError> {
        self.fetch_children(code).await
    }
}

/// Children come back as a bare array, or wrapped in `children` or `data`.
pub fn parse_children_payload(url: &str, payload: Value) -> Result<Vec<ApiCode>, LookupError> {
    let items = match payload {
        Value::Null => return Ok(Vec::new()),
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("children").or_else(|| obj.remove("data")) {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(_) => {
                return Err(LookupError::Decode {
                    url: url.to_string(),
                    message: "children field is not an array".to_string(),
                });
            }
        },
        _ => {
            return Err(LookupError::Decode {
                url: url.to_string(),
                message: "children payload is neither an array nor an object".to_string(),
            });
        }
    };

    let total = items.len();
    let mut records = Vec::with_capacity(total);
    for (index, item) in items.into_iter().enumerate() {
        if !item.is_object() {
            return Err(LookupError::Decode {
                url: url.to_string(),
                message: format!("child record {index} is not an object"),
            });
        }
        if let Some(record) = ApiCode::from_record(item) {
            records.push(record);
        }
    }
    if records.len() < total {
        debug!(
            url,
            dropped = total - records.len(),
            "skipped child records without a code value"
        );
    }
    Ok(records)
}
