//! Arrow Flight gRPC service for Hangar
//!
//! Protocol:
//!   do_put(FlightDescriptor{cmd|path} + batches + commit frame {rows})
//!                                                → store table, ack JSON {rows,bytes,batches,replaced}
//!   do_get(Ticket { ticket: hex key })           → stream the table's batches in append order
//!   get_flight_info(FlightDescriptor)            → schema, row count, IPC size, ticket, location
//!   list_flights(_)                              → FlightInfo for every stored table
//!   do_action(clear | drop_table | shutdown | healthcheck)

use std::sync::Arc;
use std::time::Duration;

use arrow::ipc::writer::IpcWriteOptions;
use arrow_flight::{
    decode::{DecodedPayload, FlightDataDecoder},
    encode::{DictionaryHandling, FlightDataEncoderBuilder},
    error::FlightError,
    flight_service_server::FlightService,
    Action, ActionType, Criteria, Empty, FlightData, FlightDescriptor, FlightEndpoint,
    FlightInfo, HandshakeRequest, HandshakeResponse, PollInfo, PutResult, SchemaAsIpc,
    SchemaResult, Ticket,
};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};

use crate::buffer::TableSummary;
use crate::catalog::Catalog;
use crate::flow::{GetFlow, PutFlow};
use crate::key::{parse_ticket, TableKey};
use crate::HangarError;

use super::lifecycle::Lifecycle;

/// Administrative actions, exactly the ones `do_action` handles
pub const ACTIONS: &[(&str, &str)] = &[
    ("clear", "Clear the stored flights."),
    ("drop_table", "Drop a table. Body = table name bytes."),
    ("shutdown", "Shut down this server."),
    ("healthcheck", "Check that the server is answering."),
];

/// Body of the `clear` action result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearAck {
    pub dropped: usize,
}

/// Last message of a put: no IPC header, `app_metadata` is `{"rows":N}`.
/// Without it the put is discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutCommit {
    pub rows: usize,
}

impl PutCommit {
    pub fn to_flight_data(&self) -> Result<FlightData, HangarError> {
        Ok(FlightData::new().with_app_metadata(serde_json::to_vec(self)?))
    }

    fn from_flight_data(data: &FlightData) -> Option<Result<Self, HangarError>> {
        if !data.data_header.is_empty() {
            return None;
        }
        Some(serde_json::from_slice(&data.app_metadata).map_err(HangarError::from))
    }
}

pub const SHUTDOWN_ACK: &[u8] = b"Shutdown!";
pub const HEALTHCHECK_ACK: &[u8] = b"ok";

// ── helpers ──────────────────────────────────────────────────────────────────

fn server_message(method: &str, key: &TableKey) {
    log::info!("(server) {} {}", method, key);
}

fn shutting_down() -> Status {
    HangarError::Aborted("server shutting down".to_string()).into()
}

/// Inbound stream failure during a put
fn stream_error(err: FlightError) -> HangarError {
    match err {
        FlightError::Tonic(status) => HangarError::Disconnected(status.message().to_string()),
        other => HangarError::Aborted(format!("undecodable put stream: {}", other)),
    }
}

/// Pull the commit frame out of the inbound put stream into `slot`.
fn take_commit(
    slot: &Mutex<Option<PutCommit>>,
    data: FlightData,
) -> Result<Option<FlightData>, FlightError> {
    let mut slot = slot.lock();
    if slot.is_some() {
        return Err(FlightError::ProtocolError(
            "message after put commit".to_string(),
        ));
    }
    match PutCommit::from_flight_data(&data) {
        None => Ok(Some(data)),
        Some(Ok(commit)) => {
            *slot = Some(commit);
            Ok(None)
        }
        Some(Err(e)) => Err(FlightError::ProtocolError(format!(
            "bad commit frame: {}",
            e
        ))),
    }
}

fn apply_payload(flow: &mut PutFlow, payload: DecodedPayload) -> Result<(), HangarError> {
    match payload {
        DecodedPayload::None => Ok(()),
        DecodedPayload::Schema(schema) => flow.on_schema(schema),
        DecodedPayload::RecordBatch(batch) => flow.on_batch(batch),
    }
}

/// Build the advertised info for a stored table. Derived on every call,
/// never cached.
fn flight_info(
    key: &TableKey,
    summary: &TableSummary,
    location: &str,
) -> Result<FlightInfo, HangarError> {
    let endpoint = FlightEndpoint::new()
        .with_ticket(Ticket::new(key.to_ticket()))
        .with_location(location);

    Ok(FlightInfo::new()
        .try_with_schema(&summary.schema)?
        .with_descriptor(key.to_descriptor())
        .with_endpoint(endpoint)
        .with_total_records(summary.num_rows as i64)
        .with_total_bytes(summary.byte_size as i64)
        .with_ordered(true))
}

/// End `stream` with an explicit `Aborted` status once `token` fires.
fn abort_on_shutdown<T: Send + 'static>(
    stream: BoxStream<'static, Result<T, Status>>,
    token: CancellationToken,
) -> BoxStream<'static, Result<T, Status>> {
    futures::stream::unfold(Some((stream, token)), |state| async move {
        let (mut stream, token) = state?;
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            item = stream.next() => Some(item),
        };
        match next {
            None => Some((Err(shutting_down()), None)),
            Some(item) => item.map(|item| (item, Some((stream, token)))),
        }
    })
    .boxed()
}

fn single<T: Send + 'static>(item: T) -> BoxStream<'static, Result<T, Status>> {
    futures::stream::once(futures::future::ready(Ok(item))).boxed()
}

// ── service ───────────────────────────────────────────────────────────────────

pub struct HangarFlightService {
    catalog: Arc<Catalog>,
    lifecycle: Arc<Lifecycle>,
    location: String,
    shutdown_grace: Duration,
}

impl HangarFlightService {
    pub fn new(
        catalog: Arc<Catalog>,
        lifecycle: Arc<Lifecycle>,
        location: impl Into<String>,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            catalog,
            lifecycle,
            location: location.into(),
            shutdown_grace,
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// `grpc+tcp://host:port` advertised in every endpoint
    pub fn location(&self) -> &str {
        &self.location
    }

    fn resolve_descriptor(
        &self,
        method: &str,
        descriptor: &FlightDescriptor,
    ) -> Result<(TableKey, TableSummary), HangarError> {
        let key = TableKey::from_descriptor(descriptor)?;
        server_message(method, &key);
        let table = self.catalog.get(&key)?;
        Ok((key, table.summary()))
    }

    async fn run_put(&self, inbound: Streaming<FlightData>) -> Result<PutResult, HangarError> {
        let commit: Arc<Mutex<Option<PutCommit>>> = Arc::default();
        let slot = Arc::clone(&commit);
        let frames = inbound
            .map_err(FlightError::from)
            .try_filter_map(move |data| futures::future::ready(take_commit(&slot, data)));
        let mut decoder = FlightDataDecoder::new(frames);
        let token = self.lifecycle.token();

        let first = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            first = decoder.next() => Some(first),
        };
        let first = match first {
            None => return Err(HangarError::Aborted("server shutting down".to_string())),
            Some(None) => {
                return Err(HangarError::MalformedDescriptor(
                    "put stream carried no messages".to_string(),
                ))
            }
            Some(Some(Err(e))) => return Err(stream_error(e)),
            Some(Some(Ok(first))) => first,
        };

        // The descriptor rides on the first message
        let descriptor = first.inner.flight_descriptor.as_ref().ok_or_else(|| {
            HangarError::MalformedDescriptor("first put message has no descriptor".to_string())
        })?;
        let key = TableKey::from_descriptor(descriptor)?;
        server_message("do_put", &key);

        let mut flow = PutFlow::open(Arc::clone(&self.catalog), key);
        apply_payload(&mut flow, first.payload)?;

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                next = decoder.next() => Some(next),
            };
            match next {
                None => {
                    flow.abort("server shutting down");
                    return Err(HangarError::Aborted("server shutting down".to_string()));
                }
                Some(None) => break,
                Some(Some(Ok(decoded))) => apply_payload(&mut flow, decoded.payload)?,
                Some(Some(Err(e))) => {
                    let err = stream_error(e);
                    flow.abort(&err.to_string());
                    return Err(err);
                }
            }
        }

        let commit = *commit.lock();
        let receipt = match commit {
            Some(commit) => flow.commit(commit.rows)?,
            None => return Err(flow.disconnect()),
        };
        Ok(PutResult {
            app_metadata: serde_json::to_vec(&receipt)?.into(),
        })
    }

    fn run_action(&self, action: &Action) -> Result<Bytes, HangarError> {
        match action.r#type.as_str() {
            "clear" => {
                let dropped = self.catalog.clear();
                log::info!("(server) clear {} tables", dropped);
                Ok(serde_json::to_vec(&ClearAck { dropped })?.into())
            }
            "drop_table" => {
                let key = TableKey::command(action.body.clone())?;
                server_message("drop_table", &key);
                self.catalog.drop_table(&key)?;
                Ok(action.body.clone())
            }
            "shutdown" => {
                log::info!("(server) shutdown");
                if !self.lifecycle.schedule_shutdown(self.shutdown_grace) {
                    log::debug!("shutdown already scheduled");
                }
                Ok(Bytes::from_static(SHUTDOWN_ACK))
            }
            "healthcheck" => Ok(Bytes::from_static(HEALTHCHECK_ACK)),
            other => Err(HangarError::UnknownAction(other.to_string())),
        }
    }
}

#[tonic::async_trait]
impl FlightService for HangarFlightService {
    type HandshakeStream    = BoxStream<'static, Result<HandshakeResponse, Status>>;
    type ListFlightsStream  = BoxStream<'static, Result<FlightInfo, Status>>;
    type DoGetStream        = BoxStream<'static, Result<FlightData, Status>>;
    type DoPutStream        = BoxStream<'static, Result<PutResult, Status>>;
    type DoExchangeStream   = BoxStream<'static, Result<FlightData, Status>>;
    type DoActionStream     = BoxStream<'static, Result<arrow_flight::Result, Status>>;
    type ListActionsStream  = BoxStream<'static, Result<ActionType, Status>>;

    // ── handshake (no-auth passthrough) ──────────────────────────────────────
    async fn handshake(
        &self,
        _req: Request<Streaming<HandshakeRequest>>,
    ) -> Result<Response<Self::HandshakeStream>, Status> {
        Ok(Response::new(futures::stream::empty().boxed()))
    }

    // ── list_flights: criteria is accepted and ignored ───────────────────────
    async fn list_flights(
        &self,
        _req: Request<Criteria>,
    ) -> Result<Response<Self::ListFlightsStream>, Status> {
        log::info!("(server) list_flights");
        let location = self.location.clone();
        let infos = self
            .catalog
            .list()
            .map(move |(key, summary)| flight_info(&key, &summary, &location).map_err(Status::from));
        Ok(Response::new(futures::stream::iter(infos).boxed()))
    }

    // ── get_flight_info ──────────────────────────────────────────────────────
    async fn get_flight_info(
        &self,
        req: Request<FlightDescriptor>,
    ) -> Result<Response<FlightInfo>, Status> {
        let descriptor = req.into_inner();
        let (key, summary) = self.resolve_descriptor("get_flight_info", &descriptor)?;
        Ok(Response::new(flight_info(&key, &summary, &self.location)?))
    }

    // ── poll_flight_info: tables are always complete ─────────────────────────
    async fn poll_flight_info(
        &self,
        req: Request<FlightDescriptor>,
    ) -> Result<Response<PollInfo>, Status> {
        let info = self.get_flight_info(req).await?.into_inner();
        Ok(Response::new(PollInfo {
            info: Some(info),
            flight_descriptor: None,
            progress: Some(1.0),
            expiration_time: None,
        }))
    }

    // ── get_schema ───────────────────────────────────────────────────────────
    async fn get_schema(
        &self,
        req: Request<FlightDescriptor>,
    ) -> Result<Response<SchemaResult>, Status> {
        let descriptor = req.into_inner();
        let (_, summary) = self.resolve_descriptor("get_schema", &descriptor)?;
        let options = IpcWriteOptions::default();
        let result = SchemaResult::try_from(SchemaAsIpc::new(&summary.schema, &options))
            .map_err(HangarError::from)?;
        Ok(Response::new(result))
    }

    // ── do_get: stream a stored table ────────────────────────────────────────
    async fn do_get(
        &self,
        req: Request<Ticket>,
    ) -> Result<Response<Self::DoGetStream>, Status> {
        let ticket = req.into_inner();
        let ticket = std::str::from_utf8(&ticket.ticket)
            .map_err(|_| HangarError::MalformedTicket("ticket is not UTF-8".to_string()))?;
        let key = parse_ticket(ticket)?;
        server_message("do_get", &key);

        let mut flow = GetFlow::new(key);
        let schema = flow.resolve(&self.catalog)?;

        let batches = futures::stream::iter(flow.map(Ok::<_, FlightError>));
        let stream = FlightDataEncoderBuilder::new()
            .with_schema(schema)
            .with_dictionary_handling(DictionaryHandling::Resend)
            .build(batches)
            .map_err(Status::from)
            .boxed();
        Ok(Response::new(abort_on_shutdown(stream, self.lifecycle.token())))
    }

    // ── do_put: stage batches, commit on the commit frame ────────────────────
    async fn do_put(
        &self,
        req: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoPutStream>, Status> {
        let ack = self.run_put(req.into_inner()).await?;
        Ok(Response::new(single(ack)))
    }

    // ── do_exchange ──────────────────────────────────────────────────────────
    async fn do_exchange(
        &self,
        _req: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoExchangeStream>, Status> {
        Err(HangarError::Unimplemented("do_exchange".to_string()).into())
    }

    // ── do_action ────────────────────────────────────────────────────────────
    async fn do_action(
        &self,
        req: Request<Action>,
    ) -> Result<Response<Self::DoActionStream>, Status> {
        let action = req.into_inner();
        let body = self.run_action(&action)?;
        Ok(Response::new(single(arrow_flight::Result { body })))
    }

    // ── list_actions ─────────────────────────────────────────────────────────
    async fn list_actions(
        &self,
        _req: Request<Empty>,
    ) -> Result<Response<Self::ListActionsStream>, Status> {
        let actions = ACTIONS.iter().map(|(name, description)| {
            Ok(ActionType {
                r#type: name.to_string(),
                description: description.to_string(),
            })
        });
        Ok(Response::new(futures::stream::iter(actions).boxed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int32Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use tonic::Code;

    fn service() -> HangarFlightService {
        HangarFlightService::new(
            Arc::new(Catalog::new()),
            Arc::new(Lifecycle::new()),
            "grpc+tcp://localhost:5005",
            Duration::from_millis(50),
        )
    }

    fn store(service: &HangarFlightService, name: &str, values: Vec<i32>) {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int32, false)]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(values))]).unwrap();
        let mut flow = PutFlow::open(service.catalog().clone(), TableKey::command(name.to_string()).unwrap());
        flow.on_schema(batch.schema()).unwrap();
        flow.on_batch(batch).unwrap();
        flow.close().unwrap();
    }

    async fn action(service: &HangarFlightService, name: &str, body: &str) -> Result<Vec<Bytes>, Status> {
        let response = service
            .do_action(Request::new(Action::new(name, body.to_string())))
            .await?;
        let results: Vec<arrow_flight::Result> = response.into_inner().try_collect().await?;
        Ok(results.into_iter().map(|r| r.body).collect())
    }

    #[tokio::test]
    async fn test_flight_info_describes_table() {
        let service = service();
        store(&service, "nums", vec![1, 2, 3]);

        let descriptor = FlightDescriptor::new_cmd("nums");
        let info = service
            .get_flight_info(Request::new(descriptor.clone()))
            .await
            .unwrap()
            .into_inner();

        let table = service
            .catalog()
            .get(&TableKey::command("nums").unwrap())
            .unwrap();
        assert_eq!(info.total_records, 3);
        assert_eq!(info.total_bytes, table.byte_size() as i64);
        assert_eq!(info.flight_descriptor, Some(descriptor));
        assert_eq!(info.endpoint.len(), 1);
        assert_eq!(info.endpoint[0].location[0].uri, "grpc+tcp://localhost:5005");

        let ticket = info.endpoint[0].ticket.as_ref().unwrap();
        let key = parse_ticket(std::str::from_utf8(&ticket.ticket).unwrap()).unwrap();
        assert_eq!(key, TableKey::command("nums").unwrap());
        assert_eq!(info.try_decode_schema().unwrap().field(0).name(), "v");
    }

    #[tokio::test]
    async fn test_missing_table_is_not_found() {
        let service = service();
        let status = service
            .get_flight_info(Request::new(FlightDescriptor::new_cmd("missing")))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);

        let ticket = Ticket::new(TableKey::command("missing").unwrap().to_ticket());
        let status = service.do_get(Request::new(ticket)).await.err().unwrap();
        assert_eq!(status.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn test_bad_ticket_is_malformed() {
        let service = service();
        let status = service
            .do_get(Request::new(Ticket::new("(2, b'chars', ())")))
            .await
            .err()
            .unwrap();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert!(matches!(
            HangarError::from_status(&status),
            HangarError::MalformedTicket(_)
        ));
    }

    #[tokio::test]
    async fn test_do_get_streams_schema_and_batches() {
        let service = service();
        store(&service, "nums", vec![4, 5]);

        let ticket = Ticket::new(TableKey::command("nums").unwrap().to_ticket());
        let stream = service.do_get(Request::new(ticket)).await.unwrap().into_inner();
        let messages: Vec<FlightData> = stream.try_collect().await.unwrap();
        // schema message + one batch
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn test_list_flights_and_actions() {
        let service = service();
        store(&service, "b", vec![1]);
        store(&service, "a", vec![1, 2]);

        let infos: Vec<FlightInfo> = service
            .list_flights(Request::new(Criteria::default()))
            .await
            .unwrap()
            .into_inner()
            .try_collect()
            .await
            .unwrap();
        let names: Vec<_> = infos
            .iter()
            .map(|i| {
                TableKey::from_descriptor(i.flight_descriptor.as_ref().unwrap())
                    .unwrap()
                    .name()
            })
            .collect();
        assert_eq!(names, vec!["a", "b"]);

        let actions: Vec<ActionType> = service
            .list_actions(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner()
            .try_collect()
            .await
            .unwrap();
        let names: Vec<_> = actions.iter().map(|a| a.r#type.as_str()).collect();
        assert_eq!(names, vec!["clear", "drop_table", "shutdown", "healthcheck"]);
    }

    #[tokio::test]
    async fn test_actions() {
        let service = service();
        store(&service, "a", vec![1]);
        store(&service, "b", vec![2]);

        assert_eq!(action(&service, "healthcheck", "").await.unwrap(), vec![Bytes::from_static(HEALTHCHECK_ACK)]);

        action(&service, "drop_table", "a").await.unwrap();
        let status = action(&service, "drop_table", "a").await.unwrap_err();
        assert_eq!(status.code(), Code::NotFound);

        let body = action(&service, "clear", "").await.unwrap();
        let ack: ClearAck = serde_json::from_slice(&body[0]).unwrap();
        assert_eq!(ack.dropped, 1);
        assert!(service.catalog().is_empty());

        let status = action(&service, "compact", "").await.unwrap_err();
        assert!(matches!(
            HangarError::from_status(&status),
            HangarError::UnknownAction(name) if name == "compact"
        ));
    }

    #[test]
    fn test_commit_frame_is_split_from_data() {
        let slot = Mutex::new(None);
        let data = FlightData::new().with_data_header(Bytes::from_static(b"header"));
        assert!(take_commit(&slot, data.clone()).unwrap().is_some());

        let frame = PutCommit { rows: 3 }.to_flight_data().unwrap();
        assert!(take_commit(&slot, frame).unwrap().is_none());
        assert_eq!(*slot.lock(), Some(PutCommit { rows: 3 }));

        // Nothing may follow the commit
        assert!(take_commit(&slot, data).is_err());

        let garbled = FlightData::new().with_app_metadata(Bytes::from_static(b"rows=3"));
        assert!(take_commit(&Mutex::new(None), garbled).is_err());
    }

    #[tokio::test]
    async fn test_shutdown_acks_before_stopping() {
        let service = service();
        let token = service.lifecycle.token();

        let body = action(&service, "shutdown", "").await.unwrap();
        assert_eq!(body, vec![Bytes::from_static(SHUTDOWN_ACK)]);
        assert!(!token.is_cancelled());

        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_get_stream_aborts_on_shutdown() {
        let service = service();
        store(&service, "nums", vec![1, 2, 3]);
        service.lifecycle.shutdown_now();

        let ticket = Ticket::new(TableKey::command("nums").unwrap().to_ticket());
        let mut stream = service.do_get(Request::new(ticket)).await.unwrap().into_inner();
        let status = stream.next().await.unwrap().unwrap_err();
        assert_eq!(status.code(), Code::Aborted);
        assert!(stream.next().await.is_none());
    }
}
