use super::model::{
    DeletedPage, ErrorBody, ErrorEnvelope, NewRecord, QueryOptions, Record, RecordUpdate,
    RecordsPage,
};
use super::{ApiConnector, ApiFailure, RecordsApi};
use crate::db::BaseRecord;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_API_URL: &str = "https://api.airtable.com/";

/// The upstream accepts at most this many records per write request.
pub const MAX_RECORDS_PER_REQUEST: usize = 10;

/// Builds reqwest-backed API handles; one shared connection pool for all bases.
#[derive(Clone)]
pub struct HttpConnector {
    http: Client,
    base_url: Url,
}

impl fmt::Debug for HttpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnector")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpConnector {
    pub fn new(api_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(api_url).with_context(|| format!("invalid api url {}", api_url))?;
        let http = Client::builder()
            .user_agent("record-relay/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self { http, base_url })
    }
}

impl ApiConnector for HttpConnector {
    fn connect(&self, base: &BaseRecord) -> Result<Arc<dyn RecordsApi>, ApiFailure> {
        if base.api_key.trim().is_empty() {
            return Err(ApiFailure::new(
                Some(401),
                Some("AUTHENTICATION_REQUIRED"),
                format!("base {} has no api key", base.base_id),
            ));
        }
        Ok(Arc::new(HttpRecordsApi {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            base_id: base.base_id.clone(),
            api_key: base.api_key.clone(),
        }))
    }
}

/// Record API scoped to one base.
#[derive(Clone)]
pub struct HttpRecordsApi {
    http: Client,
    base_url: Url,
    base_id: String,
    api_key: String,
}

impl fmt::Debug for HttpRecordsApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRecordsApi")
            .field("base_url", &self.base_url)
            .field("base_id", &self.base_id)
            .finish_non_exhaustive()
    }
}

impl HttpRecordsApi {
    fn endpoint(&self, resource_id: &str, record_id: Option<&str>) -> Result<Url, ApiFailure> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ApiFailure::transport("api url cannot be a base"))?;
            segments
                .pop_if_empty()
                .extend(["v0", self.base_id.as_str(), resource_id]);
            if let Some(id) = record_id {
                segments.push(id);
            }
        }
        Ok(url)
    }

    pub fn build_request(
        &self,
        method: Method,
        resource_id: &str,
        record_id: Option<&str>,
        params: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<reqwest::Request, ApiFailure> {
        let url = self.endpoint(resource_id, record_id)?;
        let mut builder = self
            .http
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.api_key));
        if !params.is_empty() {
            builder = builder.query(params);
        }
        if let Some(body) = body {
            builder = builder
                .header("Content-Type", "application/json")
                .json(body);
        }
        builder
            .build()
            .map_err(|e| ApiFailure::transport(format!("failed to build request: {}", e)))
    }

    async fn execute<T: DeserializeOwned>(&self, request: reqwest::Request) -> Result<T, ApiFailure> {
        debug!(method = %request.method(), url = %request.url(), "upstream request");
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| ApiFailure::transport(format!("failed to reach upstream: {}", e)))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            if status == StatusCode::TOO_MANY_REQUESTS {
                warn!(base_id = %self.base_id, "rate limited by upstream");
            }
            return Err(failure_from_response(status, &body));
        }
        res.json::<T>()
            .await
            .map_err(|e| ApiFailure::transport(format!("invalid upstream response: {}", e)))
    }
}

/// Turn a non-success response into an [`ApiFailure`], keeping the upstream
/// error type when the body carries one.
pub fn failure_from_response(status: StatusCode, body: &str) -> ApiFailure {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(ErrorEnvelope {
            error: ErrorBody::Detailed { kind, message },
        }) => {
            let message = message.unwrap_or_else(|| kind.clone());
            ApiFailure::new(
                Some(status.as_u16()),
                Some(kind.as_str()),
                format!("{}: {}", kind, message),
            )
        }
        Ok(ErrorEnvelope {
            error: ErrorBody::Code(code),
        }) => ApiFailure::new(Some(status.as_u16()), Some(code.as_str()), code.clone()),
        Err(_) => ApiFailure::new(
            Some(status.as_u16()),
            None,
            format!("upstream error {}: {}", status, body),
        ),
    }
}

/// Query-string pairs for one page of a list request.
pub fn query_params(options: &QueryOptions, offset: Option<&str>) -> Vec<(String, String)> {
    let mut params = Vec::new();
    if let Some(formula) = &options.filter_by_formula {
        params.push(("filterByFormula".to_string(), formula.clone()));
    }
    for (i, sort) in options.sort.iter().enumerate() {
        params.push((format!("sort[{}][field]", i), sort.field.clone()));
        params.push((
            format!("sort[{}][direction]", i),
            sort.direction.as_str().to_string(),
        ));
    }
    for field in &options.fields {
        params.push(("fields[]".to_string(), field.clone()));
    }
    if let Some(max) = options.max_records {
        params.push(("maxRecords".to_string(), max.to_string()));
    }
    if let Some(size) = options.page_size {
        params.push(("pageSize".to_string(), size.to_string()));
    }
    if let Some(view) = &options.view {
        params.push(("view".to_string(), view.clone()));
    }
    if let Some(offset) = offset {
        params.push(("offset".to_string(), offset.to_string()));
    }
    params
}

#[async_trait]
impl RecordsApi for HttpRecordsApi {
    async fn create(&self, resource_id: &str, records: &[NewRecord]) -> Result<Vec<Record>, ApiFailure> {
        let mut created = Vec::with_capacity(records.len());
        for chunk in records.chunks(MAX_RECORDS_PER_REQUEST) {
            let body = json!({ "records": chunk });
            let req = self.build_request(Method::POST, resource_id, None, &[], Some(&body))?;
            let page: RecordsPage = self.execute(req).await?;
            created.extend(page.records);
        }
        Ok(created)
    }

    async fn update(
        &self,
        resource_id: &str,
        records: &[RecordUpdate],
    ) -> Result<Vec<Record>, ApiFailure> {
        let mut updated = Vec::with_capacity(records.len());
        for chunk in records.chunks(MAX_RECORDS_PER_REQUEST) {
            let body = json!({ "records": chunk });
            let req = self.build_request(Method::PATCH, resource_id, None, &[], Some(&body))?;
            let page: RecordsPage = self.execute(req).await?;
            updated.extend(page.records);
        }
        Ok(updated)
    }

    async fn delete(&self, resource_id: &str, record_ids: &[String]) -> Result<Vec<Record>, ApiFailure> {
        let mut deleted = Vec::with_capacity(record_ids.len());
        for chunk in record_ids.chunks(MAX_RECORDS_PER_REQUEST) {
            let params: Vec<(String, String)> = chunk
                .iter()
                .map(|id| ("records[]".to_string(), id.clone()))
                .collect();
            let req = self.build_request(Method::DELETE, resource_id, None, &params, None)?;
            let page: DeletedPage = self.execute(req).await?;
            deleted.extend(page.records.into_iter().map(|r| Record {
                id: r.id,
                fields: Default::default(),
                created_time: None,
                comment_count: None,
                deleted: r.deleted,
            }));
        }
        Ok(deleted)
    }

    async fn query(&self, resource_id: &str, options: &QueryOptions) -> Result<Vec<Record>, ApiFailure> {
        let limit = options.max_records.map(|m| m as usize);
        let mut records = Vec::new();
        let mut offset: Option<String> = None;
        loop {
            let params = query_params(options, offset.as_deref());
            let req = self.build_request(Method::GET, resource_id, None, &params, None)?;
            let page: RecordsPage = self.execute(req).await?;
            records.extend(page.records);
            if let Some(limit) = limit {
                if records.len() >= limit {
                    records.truncate(limit);
                    break;
                }
            }
            match page.offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }
        Ok(records)
    }

    async fn get(&self, resource_id: &str, record_id: &str) -> Result<Record, ApiFailure> {
        let req = self.build_request(Method::GET, resource_id, Some(record_id), &[], None)?;
        self.execute(req).await
    }
}
