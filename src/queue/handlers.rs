//! Job handlers that carry queued work to the upstream.

use super::JobHandler;
use crate::model::{Job, Operation, OperationKind};
use crate::upstream::{NewRecord, QueryOptions, RecordUpdate, UpstreamClient};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Deserialize)]
struct BatchPayload {
    operations: Vec<Operation>,
    resource_id: String,
    kind: OperationKind,
}

#[derive(Debug, Deserialize)]
struct SyncPayload {
    resource_id: String,
    #[serde(default)]
    options: QueryOptions,
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    resource_id: String,
    #[serde(default)]
    record_ids: Vec<String>,
}

fn fields_of(op: &Operation) -> Result<Map<String, Value>> {
    match &op.data {
        Some(Value::Object(fields)) => Ok(fields.clone()),
        Some(other) => Err(anyhow!(
            "operation {} carries non-object fields: {}",
            op.id,
            other
        )),
        None => Ok(Map::new()),
    }
}

fn record_id_of(op: &Operation) -> Result<String> {
    op.record_id
        .clone()
        .ok_or_else(|| anyhow!("{} operation {} has no record id", op.kind, op.id))
}

/// Send same-kind operations for one resource as a single upstream call
/// (queries run one by one).
pub async fn dispatch_operations(
    upstream: &UpstreamClient,
    base_id: &str,
    resource_id: &str,
    kind: OperationKind,
    ops: &[Operation],
) -> Result<Value> {
    let records = match kind {
        OperationKind::Create => {
            let items = ops
                .iter()
                .map(|op| Ok(NewRecord { fields: fields_of(op)? }))
                .collect::<Result<Vec<_>>>()?;
            upstream.create_records(base_id, resource_id, &items).await?
        }
        OperationKind::Update => {
            let items = ops
                .iter()
                .map(|op| {
                    Ok(RecordUpdate {
                        id: record_id_of(op)?,
                        fields: fields_of(op)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            upstream.update_records(base_id, resource_id, &items).await?
        }
        OperationKind::Delete => {
            let ids = ops.iter().map(record_id_of).collect::<Result<Vec<_>>>()?;
            upstream.delete_records(base_id, resource_id, &ids).await?
        }
        OperationKind::Query => {
            let mut all = Vec::new();
            for op in ops {
                let options: QueryOptions = match &op.data {
                    Some(data) => serde_json::from_value(data.clone())
                        .with_context(|| format!("operation {} has malformed query options", op.id))?,
                    None => QueryOptions::default(),
                };
                all.extend(upstream.query_records(base_id, resource_id, &options).await?);
            }
            all
        }
    };

    info!(base_id, resource_id, kind = %kind, count = records.len(), "operations dispatched");
    Ok(json!({ "count": records.len(), "records": records }))
}

/// `batch-dispatch`: one flushed batch.
pub struct BatchDispatchHandler {
    upstream: Arc<UpstreamClient>,
}

impl BatchDispatchHandler {
    pub fn new(upstream: Arc<UpstreamClient>) -> Self {
        Self { upstream }
    }
}

#[async_trait]
impl JobHandler for BatchDispatchHandler {
    async fn handle(&self, job: &Job) -> Result<Value> {
        let payload: BatchPayload =
            serde_json::from_value(job.data.clone()).context("malformed batch payload")?;
        dispatch_operations(
            &self.upstream,
            &job.base_id,
            &payload.resource_id,
            payload.kind,
            &payload.operations,
        )
        .await
    }
}

/// `operation-dispatch`: a single operation that skipped batching.
pub struct OperationDispatchHandler {
    upstream: Arc<UpstreamClient>,
}

impl OperationDispatchHandler {
    pub fn new(upstream: Arc<UpstreamClient>) -> Self {
        Self { upstream }
    }
}

#[async_trait]
impl JobHandler for OperationDispatchHandler {
    async fn handle(&self, job: &Job) -> Result<Value> {
        let op: Operation =
            serde_json::from_value(job.data.clone()).context("malformed operation payload")?;
        dispatch_operations(
            &self.upstream,
            &op.base_id,
            &op.resource_id,
            op.kind,
            std::slice::from_ref(&op),
        )
        .await
    }
}

/// `sync`: pull a resource and report how many records it holds.
pub struct SyncHandler {
    upstream: Arc<UpstreamClient>,
}

impl SyncHandler {
    pub fn new(upstream: Arc<UpstreamClient>) -> Self {
        Self { upstream }
    }
}

#[async_trait]
impl JobHandler for SyncHandler {
    async fn handle(&self, job: &Job) -> Result<Value> {
        let payload: SyncPayload =
            serde_json::from_value(job.data.clone()).context("malformed sync payload")?;
        let records = self
            .upstream
            .query_records(&job.base_id, &payload.resource_id, &payload.options)
            .await?;
        info!(base_id = %job.base_id, resource_id = %payload.resource_id, count = records.len(), "resource synced");
        Ok(json!({ "resource_id": payload.resource_id, "synced": records.len() }))
    }
}

/// `webhook`: re-fetch the records a change notification names.
pub struct WebhookHandler {
    upstream: Arc<UpstreamClient>,
}

impl WebhookHandler {
    pub fn new(upstream: Arc<UpstreamClient>) -> Self {
        Self { upstream }
    }
}

#[async_trait]
impl JobHandler for WebhookHandler {
    async fn handle(&self, job: &Job) -> Result<Value> {
        let payload: WebhookPayload =
            serde_json::from_value(job.data.clone()).context("malformed webhook payload")?;
        let mut records = Vec::with_capacity(payload.record_ids.len());
        for record_id in &payload.record_ids {
            records.push(
                self.upstream
                    .get_record(&job.base_id, &payload.resource_id, record_id)
                    .await?,
            );
        }
        Ok(json!({ "resource_id": payload.resource_id, "refreshed": records.len(), "records": records }))
    }
}
