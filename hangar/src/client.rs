//! Client facade over Arrow Flight
//!
//! Tables are addressed by name; a name maps to a command descriptor. Every
//! server-reported failure comes back as the matching [`HangarError`]
//! variant. Nothing is retried except the initial connection.

use std::sync::Arc;
use std::time::Duration;

use arrow::compute::concat_batches;
use arrow::datatypes::{Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use arrow_flight::decode::DecodedPayload;
use arrow_flight::encode::{DictionaryHandling, FlightDataEncoderBuilder};
use arrow_flight::error::FlightError;
use arrow_flight::{Action, ActionType, FlightClient, FlightInfo, Ticket};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use tonic::transport::Endpoint;

use crate::buffer::schemas_match;
use crate::catalog::CommitReceipt;
use crate::flight::{ClearAck, PutCommit, SHUTDOWN_ACK};
use crate::key::TableKey;
use crate::{HangarError, Result};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Batches longer than this are split before sending; 0 disables splitting
    pub max_batch_rows: usize,
    /// Extra connection attempts while the server is not yet available
    pub connect_retries: u32,
    pub retry_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5005,
            max_batch_rows: 64 * 1024,
            connect_retries: 10,
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// What the server advertises for one stored table
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub name: String,
    pub key: TableKey,
    pub schema: SchemaRef,
    pub num_rows: i64,
    pub byte_size: i64,
    pub ticket: String,
    pub locations: Vec<String>,
}

impl TableInfo {
    fn try_from_info(info: FlightInfo) -> Result<Self> {
        let descriptor = info.flight_descriptor.clone().ok_or_else(|| {
            HangarError::MalformedDescriptor("flight info has no descriptor".to_string())
        })?;
        let key = TableKey::from_descriptor(&descriptor)?;
        let endpoint = info.endpoint.first().cloned().unwrap_or_default();
        let ticket = endpoint
            .ticket
            .map(|t| String::from_utf8_lossy(&t.ticket).into_owned())
            .unwrap_or_default();
        let locations = endpoint.location.into_iter().map(|l| l.uri).collect();
        let num_rows = info.total_records;
        let byte_size = info.total_bytes;
        let schema = Arc::new(info.try_decode_schema()?);

        Ok(Self {
            name: key.name(),
            key,
            schema,
            num_rows,
            byte_size,
            ticket,
            locations,
        })
    }
}

/// Split batches longer than `max_rows` into zero-copy slices.
fn rechunk(batches: &[RecordBatch], max_rows: usize) -> Vec<RecordBatch> {
    let mut out = Vec::with_capacity(batches.len());
    for batch in batches {
        if max_rows == 0 || batch.num_rows() <= max_rows {
            out.push(batch.clone());
            continue;
        }
        let mut offset = 0;
        while offset < batch.num_rows() {
            let len = max_rows.min(batch.num_rows() - offset);
            out.push(batch.slice(offset, len));
            offset += len;
        }
    }
    out
}

/// Group consecutive batches that share a schema. Each run is sent with its
/// own schema message, so the server sees (and rejects) a schema change.
fn schema_runs(batches: Vec<RecordBatch>) -> Vec<Vec<RecordBatch>> {
    let mut runs: Vec<Vec<RecordBatch>> = Vec::new();
    for batch in batches {
        match runs.last_mut() {
            Some(run) if schemas_match(&run[0].schema(), &batch.schema()) => run.push(batch),
            _ => runs.push(vec![batch]),
        }
    }
    runs
}

pub struct HangarClient {
    inner: FlightClient,
    config: ClientConfig,
}

impl HangarClient {
    /// Connect, retrying while the server is not yet listening.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let endpoint = Endpoint::from_shared(format!("http://{}:{}", config.host, config.port))?;

        let mut attempt = 0;
        let channel = loop {
            match endpoint.connect().await {
                Ok(channel) => break channel,
                Err(e) if attempt < config.connect_retries => {
                    attempt += 1;
                    log::debug!(
                        "connect to {}:{} failed (attempt {}): {}",
                        config.host,
                        config.port,
                        attempt,
                        e
                    );
                    tokio::time::sleep(config.retry_delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        };

        Ok(Self {
            inner: FlightClient::new(channel),
            config,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Store `batches` under `name`, replacing any existing table.
    pub async fn put_table(&mut self, name: &str, batches: &[RecordBatch]) -> Result<CommitReceipt> {
        if batches.is_empty() {
            return Err(HangarError::InvalidInput(format!(
                "table {} has no record batches",
                name
            )));
        }
        let key = TableKey::command(name.to_string())?;
        let rows = batches.iter().map(RecordBatch::num_rows).sum();
        let commit = PutCommit { rows }.to_flight_data()?;
        let runs = schema_runs(rechunk(batches, self.config.max_batch_rows));

        let mut encoders = Vec::with_capacity(runs.len());
        for (i, run) in runs.into_iter().enumerate() {
            let mut builder = FlightDataEncoderBuilder::new()
                .with_schema(run[0].schema())
                .with_dictionary_handling(DictionaryHandling::Resend);
            if i == 0 {
                builder = builder.with_flight_descriptor(Some(key.to_descriptor()));
            }
            encoders.push(builder.build(futures::stream::iter(run.into_iter().map(Ok::<_, FlightError>))));
        }
        // The server commits only on the trailing commit frame
        let flight_data = futures::stream::iter(encoders)
            .flatten()
            .chain(futures::stream::once(futures::future::ready(Ok(commit))));

        let mut results = self.inner.do_put(flight_data).await?;
        let mut receipt = None;
        while let Some(result) = results.next().await {
            let result = result?;
            receipt = Some(serde_json::from_slice::<CommitReceipt>(&result.app_metadata)?);
        }
        receipt.ok_or_else(|| HangarError::Aborted(format!("put {} was not acknowledged", key)))
    }

    /// Fetch a table as its stored batches, in order.
    pub async fn get_batches(&mut self, name: &str) -> Result<(SchemaRef, Vec<RecordBatch>)> {
        let key = TableKey::command(name.to_string())?;
        self.get_by_ticket(&key.to_ticket()).await
    }

    /// Fetch a table concatenated into one batch.
    pub async fn get_table(&mut self, name: &str) -> Result<RecordBatch> {
        let (schema, batches) = self.get_batches(name).await?;
        Ok(concat_batches(&schema, &batches)?)
    }

    /// Fetch with a ticket taken from `describe_table` or `list_flights`.
    pub async fn get_by_ticket(&mut self, ticket: &str) -> Result<(SchemaRef, Vec<RecordBatch>)> {
        let mut decoder = self
            .inner
            .do_get(Ticket::new(ticket.to_string()))
            .await?
            .into_inner();

        let mut schema = None;
        let mut batches = Vec::new();
        while let Some(decoded) = decoder.try_next().await? {
            match decoded.payload {
                DecodedPayload::Schema(s) => schema = Some(s),
                DecodedPayload::RecordBatch(batch) => batches.push(batch),
                DecodedPayload::None => {}
            }
        }
        let schema = schema.unwrap_or_else(|| Arc::new(Schema::empty()));
        Ok((schema, batches))
    }

    pub async fn describe_table(&mut self, name: &str) -> Result<TableInfo> {
        let key = TableKey::command(name.to_string())?;
        let info = self.inner.get_flight_info(key.to_descriptor()).await?;
        TableInfo::try_from_info(info)
    }

    /// Every stored table, as advertised by `list_flights`
    pub async fn list_infos(&mut self) -> Result<Vec<TableInfo>> {
        let mut infos = self.inner.list_flights(Bytes::new()).await?;
        let mut out = Vec::new();
        while let Some(info) = infos.try_next().await? {
            out.push(TableInfo::try_from_info(info)?);
        }
        Ok(out)
    }

    /// Names of all stored tables; path keys are joined with `/`.
    pub async fn list_tables(&mut self) -> Result<Vec<String>> {
        Ok(self
            .list_infos()
            .await?
            .into_iter()
            .map(|info| info.name)
            .collect())
    }

    pub async fn drop_table(&mut self, name: &str) -> Result<()> {
        self.action("drop_table", Bytes::from(name.to_string())).await?;
        Ok(())
    }

    /// Remove every table; returns how many were dropped
    pub async fn clear(&mut self) -> Result<usize> {
        let bodies = self.action("clear", Bytes::new()).await?;
        let body = bodies
            .first()
            .ok_or_else(|| HangarError::Aborted("clear returned no result".to_string()))?;
        let ack: ClearAck = serde_json::from_slice(body)?;
        Ok(ack.dropped)
    }

    pub async fn healthcheck(&mut self) -> Result<()> {
        self.action("healthcheck", Bytes::new()).await?;
        Ok(())
    }

    /// Ask the server to stop. Returns once the server has acknowledged;
    /// the server stops after its grace period.
    pub async fn shutdown(&mut self) -> Result<()> {
        let bodies = self.action("shutdown", Bytes::new()).await?;
        match bodies.first() {
            Some(body) if body.as_ref() == SHUTDOWN_ACK => Ok(()),
            _ => Err(HangarError::Aborted(
                "shutdown was not acknowledged".to_string(),
            )),
        }
    }

    pub async fn list_actions(&mut self) -> Result<Vec<(String, String)>> {
        let actions: Vec<ActionType> = self.inner.list_actions().await?.try_collect().await?;
        Ok(actions
            .into_iter()
            .map(|a| (a.r#type, a.description))
            .collect())
    }

    async fn action(&mut self, name: &str, body: Bytes) -> Result<Vec<Bytes>> {
        let results = self.inner.do_action(Action::new(name, body)).await?;
        Ok(results.try_collect().await?)
    }
}
