//! Aggregation query transport.

use crate::config::ClickHouseConfig;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query transport failed: {0}")]
    Transport(String),

    #[error("query rejected ({status}): {message}")]
    Query { status: u16, message: String },

    #[error("could not decode query result: {0}")]
    Decode(String),

    #[error("query cancelled")]
    Cancelled,
}

impl QueryError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueryError::Cancelled)
    }
}

/// Runs an aggregation query and returns its rows as JSON objects.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn run_aggregation(
        &self,
        sql: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<serde_json::Value>, QueryError>;
}

/// `FORMAT JSON` response body.
#[derive(Debug, Deserialize)]
struct JsonFormat {
    data: Vec<serde_json::Value>,
}

/// Executes queries over the ClickHouse HTTP interface.
pub struct ClickHouseExecutor {
    client: reqwest::Client,
    endpoint: String,
    user: Option<String>,
    password: Option<String>,
}

impl ClickHouseExecutor {
    pub fn new(config: &ClickHouseConfig) -> Result<Self, QueryError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| QueryError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    async fn execute(&self, sql: &str) -> Result<Vec<serde_json::Value>, QueryError> {
        let mut req = self
            .client
            .post(&self.endpoint)
            .body(format!("{} FORMAT JSON", sql.trim_end().trim_end_matches(';')));
        if let Some(user) = &self.user {
            req = req.basic_auth(user, self.password.as_deref());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| QueryError::Transport(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| QueryError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(QueryError::Query {
                status: status.as_u16(),
                message: body.trim().to_string(),
            });
        }

        let parsed: JsonFormat =
            serde_json::from_str(&body).map_err(|e| QueryError::Decode(e.to_string()))?;
        debug!(rows = parsed.data.len(), "aggregation complete");
        Ok(parsed.data)
    }
}

#[async_trait]
impl QueryExecutor for ClickHouseExecutor {
    async fn run_aggregation(
        &self,
        sql: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<serde_json::Value>, QueryError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(QueryError::Cancelled),
            res = self.execute(sql) => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancelled_token_short_circuits() {
        // Unroutable endpoint; cancellation must win before any connect attempt matters.
        let executor = ClickHouseExecutor::new(&ClickHouseConfig {
            endpoint: "http://192.0.2.1:8123".to_string(),
            timeout_secs: 30,
            ..ClickHouseConfig::default()
        })
        .unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let err = executor.run_aggregation("SELECT 1", &token).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_json_format_parses_data() {
        let body = r#"{"meta":[{"name":"dim","type":"String"}],"data":[{"dim":"a","window_total":"12"}],"rows":1}"#;
        let parsed: JsonFormat = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.data.len(), 1);
        assert_eq!(parsed.data[0]["dim"], "a");
    }
}
