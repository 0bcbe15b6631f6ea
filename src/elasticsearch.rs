use async_trait::async_trait;
use base64::prelude::*;
use elasticsearch::{
    BulkParts, CountParts, Elasticsearch,
    http::{
        request::JsonBody,
        response::Response,
        transport::{SingleNodeConnectionPool, TransportBuilder},
    },
    indices::{
        IndicesCreateParts, IndicesDeleteParts, IndicesExistsParts, IndicesGetAliasParts,
        IndicesRefreshParts,
    },
};
use http::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde_json::{Value, json};
use std::time::Duration;
use url::Url;

use crate::backend::{AliasAction, BulkDocument, BulkSummary, SearchBackend};
use crate::error::{PipelineError, PipelineResult};
use crate::settings::Settings;

/// Value of the Basic `Authorization` header, or `None` without a username
pub fn basic_auth_header(username: &str, password: &str) -> Option<String> {
    if username.is_empty() {
        return None;
    }
    let auth_str = format!("{}:{}", username, password);
    Some(format!("Basic {}", BASE64_STANDARD.encode(auth_str)))
}

/// Create and configure the Elasticsearch client
pub fn create_client(settings: &Settings) -> PipelineResult<Elasticsearch> {
    let host_url = Url::parse(&settings.es_url())
        .map_err(|e| PipelineError::configuration(format!("Invalid Elasticsearch URL: {}", e)))?;
    log::debug!(
        "Setting up Elasticsearch client connection to {}",
        host_url.as_str()
    );

    let conn_pool = SingleNodeConnectionPool::new(host_url);
    let mut transport_builder = TransportBuilder::new(conn_pool)
        .timeout(Duration::from_secs(settings.timeout_secs));

    let mut headers = HeaderMap::new();
    if let Some(auth_val) = basic_auth_header(&settings.es_username, &settings.es_password) {
        log::info!(
            "Using basic authentication for user: {}",
            settings.es_username
        );
        let value = HeaderValue::from_str(&auth_val)
            .map_err(|e| PipelineError::configuration(format!("Invalid credentials: {}", e)))?;
        headers.insert(AUTHORIZATION, value);
    } else if !settings.es_password.is_empty() {
        log::warn!("Password provided without a username, ignoring.");
    }

    if !headers.is_empty() {
        transport_builder = transport_builder.headers(headers);
    }

    log::debug!("Building Elasticsearch transport");
    let transport = transport_builder.build().map_err(|e| {
        PipelineError::connection(format!("Failed to build Elasticsearch transport: {}", e))
    })?;

    log::debug!("Elasticsearch client created successfully");
    Ok(Elasticsearch::new(transport))
}

/// [`SearchBackend`] backed by an Elasticsearch cluster
#[derive(Clone)]
pub struct ElasticsearchBackend {
    client: Elasticsearch,
}

impl ElasticsearchBackend {
    pub fn new(client: Elasticsearch) -> Self {
        Self { client }
    }

    pub fn connect(settings: &Settings) -> PipelineResult<Self> {
        Ok(Self::new(create_client(settings)?))
    }
}

fn transport_error(what: &str, err: elasticsearch::Error) -> PipelineError {
    PipelineError::connection(format!(
        "{} request failed: {} - this might indicate connection issues or invalid credentials",
        what, err
    ))
}

/// Turn a non-success response into an indexing error carrying the body
async fn ensure_success(what: &str, response: Response) -> PipelineResult<Response> {
    let status = response.status_code();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    log::debug!("{} failed with status {}: {}", what, status, body);
    Err(PipelineError::indexing(format!(
        "{} failed with status {}: {}",
        what, status, body
    )))
}

async fn read_json(what: &str, response: Response) -> PipelineResult<Value> {
    response
        .json::<Value>()
        .await
        .map_err(|e| PipelineError::parse(format!("Failed to parse {} response: {}", what, e)))
}

/// Collect the per-item error reasons of a bulk response
pub fn bulk_item_errors(response_body: &Value) -> Vec<String> {
    if !response_body["errors"].as_bool().unwrap_or(false) {
        return Vec::new();
    }
    let mut errors = Vec::new();
    if let Some(items) = response_body["items"].as_array() {
        for item in items {
            if let Some(op_type) = item.as_object().and_then(|obj| obj.keys().next()) {
                let error = &item[op_type]["error"];
                if !error.is_null() {
                    let id = item[op_type]["_id"].as_str().unwrap_or("?");
                    let reason = error["reason"]
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| error.to_string());
                    errors.push(format!("{}: {}", id, reason));
                }
            }
        }
    }
    errors
}

/// Owner index names of a get-alias response
pub fn alias_response_indices(response_body: &Value) -> Vec<String> {
    let mut indices: Vec<String> = response_body
        .as_object()
        .map(|obj| obj.keys().cloned().collect())
        .unwrap_or_default();
    indices.sort();
    indices
}

#[async_trait]
impl SearchBackend for ElasticsearchBackend {
    async fn ping(&self) -> PipelineResult<()> {
        let response = self
            .client
            .ping()
            .send()
            .await
            .map_err(|e| transport_error("Ping", e))?;
        let status = response.status_code();
        if !status.is_success() {
            return Err(PipelineError::connection(format!(
                "Elasticsearch ping returned status {}",
                status
            )));
        }
        log::debug!("Elasticsearch ping successful");
        Ok(())
    }

    async fn count(&self, index: &str) -> PipelineResult<Option<u64>> {
        let response = self
            .client
            .count(CountParts::Index(&[index]))
            .send()
            .await
            .map_err(|e| transport_error("Count", e))?;
        if response.status_code().as_u16() == 404 {
            log::debug!("Index {} does not exist, no count available", index);
            return Ok(None);
        }
        let response = ensure_success("Count", response).await?;
        let body = read_json("count", response).await?;
        body["count"]
            .as_u64()
            .map(Some)
            .ok_or_else(|| PipelineError::parse(format!("Count response has no count: {}", body)))
    }

    async fn index_exists(&self, index: &str) -> PipelineResult<bool> {
        let response = self
            .client
            .indices()
            .exists(IndicesExistsParts::Index(&[index]))
            .send()
            .await
            .map_err(|e| transport_error("Index exists", e))?;
        Ok(response.status_code().is_success())
    }

    async fn create_index(&self, index: &str, body: &Value) -> PipelineResult<()> {
        log::debug!("Creating index {}", index);
        let response = self
            .client
            .indices()
            .create(IndicesCreateParts::Index(index))
            .body(body.clone())
            .send()
            .await
            .map_err(|e| transport_error("Create index", e))?;
        ensure_success(&format!("Create index {}", index), response).await?;
        Ok(())
    }

    async fn delete_index(&self, index: &str) -> PipelineResult<()> {
        log::debug!("Deleting index {}", index);
        let response = self
            .client
            .indices()
            .delete(IndicesDeleteParts::Index(&[index]))
            .send()
            .await
            .map_err(|e| transport_error("Delete index", e))?;
        if response.status_code().as_u16() == 404 {
            return Ok(());
        }
        ensure_success(&format!("Delete index {}", index), response).await?;
        Ok(())
    }

    async fn refresh(&self, index: &str) -> PipelineResult<()> {
        let response = self
            .client
            .indices()
            .refresh(IndicesRefreshParts::Index(&[index]))
            .send()
            .await
            .map_err(|e| transport_error("Refresh", e))?;
        ensure_success(&format!("Refresh {}", index), response).await?;
        Ok(())
    }

    async fn reindex(&self, source: &str, dest: &str) -> PipelineResult<u64> {
        log::debug!("Reindexing {} into {}", source, dest);
        let response = self
            .client
            .reindex()
            .wait_for_completion(true)
            .refresh(true)
            .body(json!({
                "source": { "index": source },
                "dest": { "index": dest }
            }))
            .send()
            .await
            .map_err(|e| transport_error("Reindex", e))?;
        let response = ensure_success(&format!("Reindex {} -> {}", source, dest), response).await?;
        let body = read_json("reindex", response).await?;
        if let Some(failures) = body["failures"].as_array() {
            if !failures.is_empty() {
                return Err(PipelineError::indexing(format!(
                    "Reindex {} -> {} reported {} failures: {}",
                    source,
                    dest,
                    failures.len(),
                    Value::Array(failures.clone())
                )));
            }
        }
        Ok(body["total"].as_u64().unwrap_or(0))
    }

    async fn alias_targets(&self, alias: &str) -> PipelineResult<Vec<String>> {
        let response = self
            .client
            .indices()
            .get_alias(IndicesGetAliasParts::Name(&[alias]))
            .send()
            .await
            .map_err(|e| transport_error("Get alias", e))?;
        if response.status_code().as_u16() == 404 {
            return Ok(Vec::new());
        }
        let response = ensure_success(&format!("Get alias {}", alias), response).await?;
        let body = read_json("get alias", response).await?;
        Ok(alias_response_indices(&body))
    }

    async fn update_aliases(&self, actions: &[AliasAction]) -> PipelineResult<()> {
        let body = json!({
            "actions": actions.iter().map(AliasAction::to_json).collect::<Vec<_>>()
        });
        log::debug!("Updating aliases: {}", body);
        let response = self
            .client
            .indices()
            .update_aliases()
            .body(body)
            .send()
            .await
            .map_err(|e| transport_error("Update aliases", e))?;
        ensure_success("Update aliases", response).await?;
        Ok(())
    }

    async fn bulk_index(
        &self,
        index: &str,
        documents: Vec<BulkDocument>,
    ) -> PipelineResult<BulkSummary> {
        if documents.is_empty() {
            return Ok(BulkSummary::default());
        }

        let doc_count = documents.len() as u64;
        let mut body: Vec<JsonBody<Value>> = Vec::with_capacity(documents.len() * 2);
        for doc in documents {
            let action = match &doc.id {
                Some(id) => json!({ "index": { "_id": id } }),
                None => json!({ "index": {} }),
            };
            body.push(action.into());
            body.push(doc.source.into());
        }

        let response = self
            .client
            .bulk(BulkParts::Index(index))
            .body(body)
            .send()
            .await
            .map_err(|e| transport_error("Bulk", e))?;
        let response = ensure_success(&format!("Bulk insert into {}", index), response).await?;
        let response_body = read_json("bulk", response).await?;

        let errors = bulk_item_errors(&response_body);
        Ok(BulkSummary {
            indexed: doc_count - errors.len() as u64,
            errors,
        })
    }
}
