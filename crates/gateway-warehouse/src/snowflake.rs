//! Snowflake SQL API v2 connector
//!
//! Statements are submitted with `POST /api/v2/statements`. A `202` response
//! means the statement is still running and its handle is polled until it
//! completes. Large results are split into partitions: the first arrives
//! inline, the rest are fetched by index (concurrently for buffered reads,
//! sequentially for streams).

use crate::credential::WarehouseCredential;
use crate::statement::{build_statement, Statement};
use crate::{ConnectorError, RowStream, WarehouseConnector};
use async_trait::async_trait;
use dataproduct_gateway_core::env::{env_parse, env_string};
use dataproduct_gateway_core::{QuerySpec, Row};
use futures::future::{ready, try_join_all};
use futures::stream::{self, StreamExt};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Default per-request HTTP timeout.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Server-side statement timeout sent with every submission.
pub const DEFAULT_STATEMENT_TIMEOUT_SECS: u64 = 60;

/// Delay between status polls for a running statement.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Polls before a running statement is reported as timed out.
pub const DEFAULT_MAX_POLL_ATTEMPTS: u32 = 120;

/// Response code for a successfully executed statement.
const SUCCESS_CODE: &str = "090001";

/// Compilation error: object does not exist or not authorized.
const OBJECT_NOT_FOUND_CODE: &str = "002003";

/// SQL compilation error: syntax error.
const SYNTAX_ERROR_CODE: &str = "001003";

const STATEMENTS_PATH: &str = "/api/v2/statements";

/// Connection settings for the SQL API.
///
/// # Environment Variables
///
/// | Variable | Default | Description |
/// |----------|---------|-------------|
/// | `SNOWFLAKE_ACCOUNT` | (required) | Account identifier, also forms the host name |
/// | `SNOWFLAKE_WAREHOUSE` | - | Virtual warehouse |
/// | `SNOWFLAKE_ROLE` | - | Role |
/// | `SNOWFLAKE_DATABASE` | - | Database |
/// | `SNOWFLAKE_SCHEMA` | - | Schema |
/// | `SNOWFLAKE_BASE_URL` | `https://<account>.snowflakecomputing.com` | Endpoint override |
/// | `DATAPRODUCT_WAREHOUSE_TIMEOUT_SECS` | 30 | Per-request HTTP timeout |
#[derive(Debug, Clone)]
pub struct SnowflakeConfig {
    pub account: String,
    pub warehouse: Option<String>,
    pub role: Option<String>,
    pub database: Option<String>,
    pub schema: Option<String>,
    pub base_url: Option<String>,
    pub request_timeout: Duration,
    pub statement_timeout_secs: u64,
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
}

impl Default for SnowflakeConfig {
    fn default() -> Self {
        Self {
            account: String::new(),
            warehouse: None,
            role: None,
            database: None,
            schema: None,
            base_url: None,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            statement_timeout_secs: DEFAULT_STATEMENT_TIMEOUT_SECS,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_poll_attempts: DEFAULT_MAX_POLL_ATTEMPTS,
        }
    }
}

impl SnowflakeConfig {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            ..Default::default()
        }
    }

    pub fn from_env() -> Self {
        Self {
            account: env_string("SNOWFLAKE_ACCOUNT").unwrap_or_default(),
            warehouse: env_string("SNOWFLAKE_WAREHOUSE"),
            role: env_string("SNOWFLAKE_ROLE"),
            database: env_string("SNOWFLAKE_DATABASE"),
            schema: env_string("SNOWFLAKE_SCHEMA"),
            base_url: env_string("SNOWFLAKE_BASE_URL"),
            request_timeout: Duration::from_secs(env_parse(
                "DATAPRODUCT_WAREHOUSE_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.account.trim().is_empty() && self.base_url.is_none() {
            return Err("SNOWFLAKE_ACCOUNT or SNOWFLAKE_BASE_URL must be set".to_string());
        }
        if self.request_timeout.is_zero() {
            return Err("request_timeout must be > 0".to_string());
        }
        if self.max_poll_attempts == 0 {
            return Err("max_poll_attempts must be > 0".to_string());
        }
        Ok(())
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_warehouse(mut self, warehouse: impl Into<String>) -> Self {
        self.warehouse = Some(warehouse.into());
        self
    }

    pub fn with_database(mut self, database: impl Into<String>, schema: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self.schema = Some(schema.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_polling(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.poll_interval = interval;
        self.max_poll_attempts = max_attempts;
        self
    }

    fn endpoint(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://{}.snowflakecomputing.com", self.account.trim()),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRequest<'a> {
    statement: &'a str,
    timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    database: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    schema: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warehouse: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bindings: Option<Value>,
    result_set_meta_data: ResultFormat,
}

#[derive(Debug, Serialize)]
struct ResultFormat {
    format: &'static str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    code: Option<String>,
    message: Option<String>,
    statement_handle: Option<String>,
    result_set_meta_data: Option<ResultSetMetaData>,
    #[serde(default)]
    data: Vec<Vec<Value>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultSetMetaData {
    num_rows: Option<u64>,
    #[serde(default)]
    row_type: Vec<ColumnType>,
    #[serde(default)]
    partition_info: Vec<PartitionInfo>,
}

#[derive(Debug, Deserialize)]
struct ColumnType {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct PartitionInfo {
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PartitionResponse {
    #[serde(default)]
    data: Vec<Vec<Value>>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
}

/// A completed statement: inline rows plus the partitions still to fetch.
struct Executed {
    columns: Arc<Vec<String>>,
    inline: Vec<Vec<Value>>,
    partition_urls: Vec<String>,
}

/// Connector for the Snowflake SQL API v2.
#[derive(Clone)]
pub struct SnowflakeConnector {
    client: reqwest::Client,
    base_url: Arc<str>,
    config: Arc<SnowflakeConfig>,
}

impl SnowflakeConnector {
    pub fn new(config: SnowflakeConfig) -> Result<Self, ConnectorError> {
        config.validate().map_err(ConnectorError::Generic)?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("dataproduct-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConnectorError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: Arc::from(config.endpoint()),
            config: Arc::new(config),
        })
    }

    fn statements_url(&self) -> String {
        format!("{}{}", self.base_url, STATEMENTS_PATH)
    }

    fn authorize(
        &self,
        request: reqwest::RequestBuilder,
        credential: &WarehouseCredential,
    ) -> reqwest::RequestBuilder {
        request
            .bearer_auth(&credential.token)
            .header("X-Snowflake-Authorization-Token-Type", "KEYPAIR_JWT")
            .header(reqwest::header::ACCEPT, "application/json")
    }

    async fn execute(
        &self,
        credential: &WarehouseCredential,
        statement: &Statement,
    ) -> Result<Executed, ConnectorError> {
        let payload = SubmitRequest {
            statement: &statement.sql,
            timeout: self.config.statement_timeout_secs,
            database: self.config.database.as_deref(),
            schema: self.config.schema.as_deref(),
            warehouse: self.config.warehouse.as_deref(),
            role: self.config.role.as_deref(),
            bindings: statement.bindings_json(),
            result_set_meta_data: ResultFormat { format: "json" },
        };

        let request = self.authorize(self.client.post(self.statements_url()), credential);
        let response = request.json(&payload).send().await.map_err(transport_error)?;

        let mut body = match response.status() {
            StatusCode::OK => parse_body::<StatementResponse>(response).await?,
            StatusCode::ACCEPTED => {
                let pending = parse_body::<StatementResponse>(response).await?;
                let handle = pending.statement_handle.ok_or_else(|| {
                    ConnectorError::Protocol("202 response without statementHandle".to_string())
                })?;
                self.poll(credential, &handle).await?
            }
            status => return Err(failure_from_response(status, response).await),
        };

        if let Some(code) = body.code.as_deref() {
            if code != SUCCESS_CODE {
                return Err(ConnectorError::Generic(format!(
                    "[{}] {}",
                    code,
                    body.message.as_deref().unwrap_or("statement failed")
                )));
            }
        }

        let handle = body.statement_handle.take().unwrap_or_default();
        let metadata = body.result_set_meta_data.take().unwrap_or_default();
        let columns: Vec<String> = metadata
            .row_type
            .iter()
            .map(|c| c.name.to_lowercase())
            .collect();

        let has_inline = !body.data.is_empty();
        if let Some(total) = metadata.num_rows {
            if metadata.partition_info.is_empty() && total > body.data.len() as u64 {
                tracing::warn!(
                    expected = total,
                    received = body.data.len(),
                    "Row count mismatch without partition info"
                );
            }
        }

        let partition_urls = metadata
            .partition_info
            .iter()
            .enumerate()
            .filter(|(index, _)| !(*index == 0 && has_inline))
            .map(|(index, info)| self.partition_url(&handle, index, info))
            .collect::<Vec<_>>();

        tracing::debug!(
            statement_handle = %handle,
            inline_rows = body.data.len(),
            partitions = partition_urls.len(),
            "Statement completed"
        );

        Ok(Executed {
            columns: Arc::new(columns),
            inline: body.data,
            partition_urls,
        })
    }

    async fn poll(
        &self,
        credential: &WarehouseCredential,
        handle: &str,
    ) -> Result<StatementResponse, ConnectorError> {
        let url = format!("{}/{}", self.statements_url(), handle);
        for attempt in 1..=self.config.max_poll_attempts {
            tokio::time::sleep(self.config.poll_interval).await;
            let response = self
                .authorize(self.client.get(&url), credential)
                .send()
                .await
                .map_err(transport_error)?;
            match response.status() {
                StatusCode::OK => return parse_body(response).await,
                StatusCode::ACCEPTED => {
                    tracing::trace!(statement_handle = %handle, attempt, "Statement still running");
                }
                status => return Err(failure_from_response(status, response).await),
            }
        }
        Err(ConnectorError::Timeout(format!(
            "statement {} still running after {} polls",
            handle, self.config.max_poll_attempts
        )))
    }

    fn partition_url(&self, handle: &str, index: usize, info: &PartitionInfo) -> String {
        match info.url.as_deref() {
            Some(url) if url.starts_with("http") => url.to_string(),
            Some(url) if url.starts_with('/') => format!("{}{}", self.base_url, url),
            Some(url) => format!("{}/{}/{}", self.statements_url(), handle, url),
            None => format!("{}/{}?partition={}", self.statements_url(), handle, index),
        }
    }

    async fn fetch_partition(
        &self,
        credential: &WarehouseCredential,
        url: &str,
    ) -> Result<Vec<Vec<Value>>, ConnectorError> {
        let response = self
            .authorize(self.client.get(url), credential)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let err = failure_from_response(status, response).await;
            tracing::error!(url, error = %err, "Failed to fetch partition");
            return Err(err);
        }
        Ok(parse_body::<PartitionResponse>(response).await?.data)
    }
}

#[async_trait]
impl WarehouseConnector for SnowflakeConnector {
    async fn fetch(
        &self,
        credential: &WarehouseCredential,
        spec: &QuerySpec,
    ) -> Result<Vec<Row>, ConnectorError> {
        let statement = build_statement(spec)?;
        let executed = self.execute(credential, &statement).await?;

        let partitions = try_join_all(
            executed
                .partition_urls
                .iter()
                .map(|url| self.fetch_partition(credential, url)),
        )
        .await?;

        let columns = &executed.columns;
        let rows = executed
            .inline
            .into_iter()
            .chain(partitions.into_iter().flatten())
            .map(|values| to_row(columns, values))
            .collect();
        Ok(rows)
    }

    async fn open_stream(
        &self,
        credential: &WarehouseCredential,
        spec: &QuerySpec,
    ) -> Result<RowStream, ConnectorError> {
        let statement = build_statement(spec)?;
        let executed = self.execute(credential, &statement).await?;

        let inline_columns = Arc::clone(&executed.columns);
        let inline = stream::iter(
            executed
                .inline
                .into_iter()
                .map(move |values| Ok(to_row(&inline_columns, values))),
        );

        let connector = self.clone();
        let credential = credential.clone();
        let columns = executed.columns;
        // Partitions are fetched one at a time as the consumer pulls; the
        // first failure ends the sequence without touching later partitions.
        let remaining = stream::unfold(
            (executed.partition_urls.into_iter(), false),
            move |(mut urls, failed)| {
                let connector = connector.clone();
                let credential = credential.clone();
                async move {
                    if failed {
                        return None;
                    }
                    let url = urls.next()?;
                    let result = connector.fetch_partition(&credential, &url).await;
                    let failed = result.is_err();
                    Some((result, (urls, failed)))
                }
            },
        )
        .flat_map(move |item| match item {
            Ok(values) => {
                let columns = Arc::clone(&columns);
                stream::iter(values.into_iter().map(move |v| Ok(to_row(&columns, v))))
                    .left_stream()
            }
            Err(e) => stream::once(ready(Err(e))).right_stream(),
        });

        Ok(inline.chain(remaining).boxed())
    }

    async fn ping(&self, credential: &WarehouseCredential) -> Result<(), ConnectorError> {
        let statement = Statement {
            sql: "SELECT 1".to_string(),
            bindings: Vec::new(),
        };
        self.execute(credential, &statement).await.map(|_| ())
    }
}

fn to_row(columns: &[String], values: Vec<Value>) -> Row {
    columns.iter().cloned().zip(values).collect()
}

async fn parse_body<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ConnectorError> {
    let bytes = response.bytes().await.map_err(transport_error)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ConnectorError::Protocol(format!("invalid response body: {e}")))
}

fn transport_error(err: reqwest::Error) -> ConnectorError {
    if err.is_timeout() {
        ConnectorError::Timeout(err.to_string())
    } else {
        ConnectorError::Transport(err.to_string())
    }
}

async fn failure_from_response(status: StatusCode, response: reqwest::Response) -> ConnectorError {
    let body = response.text().await.unwrap_or_default();
    classify_failure(status, &body)
}

/// Map an HTTP failure from the SQL API onto a connector error kind.
fn classify_failure(status: StatusCode, body: &str) -> ConnectorError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let code = parsed.code.unwrap_or_else(|| "UNKNOWN".to_string());
    let message = parsed
        .message
        .unwrap_or_else(|| body.chars().take(200).collect());
    let detail = format!("HTTP {} [{}] {}", status.as_u16(), code, message);

    match status.as_u16() {
        401 | 403 => ConnectorError::Auth(detail),
        408 | 504 => ConnectorError::Timeout(detail),
        400 => ConnectorError::InvalidQuery(detail),
        422 if code == OBJECT_NOT_FOUND_CODE => ConnectorError::NotFound(detail),
        422 if code == SYNTAX_ERROR_CODE => ConnectorError::InvalidQuery(detail),
        _ => ConnectorError::Generic(detail),
    }
}
