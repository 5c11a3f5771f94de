//! Hangar error taxonomy
//!
//! Errors raised by the catalog and the flows are local and typed. At the
//! service boundary each variant becomes a `tonic::Status` with a fitting
//! gRPC code, a human readable message and a stable code string carried in
//! the `x-hangar-error` metadata entry. The client maps that status back to
//! the same variant, so callers can match on server failures directly.

use arrow::error::ArrowError;
use arrow_flight::error::FlightError;
use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::{Code, Status};

/// Metadata key carrying the stable error code
pub const ERROR_CODE_KEY: &str = "x-hangar-error";

/// Binary metadata key carrying the variant's detail string
pub const ERROR_DETAIL_KEY: &str = "x-hangar-detail-bin";

#[derive(Debug, thiserror::Error)]
pub enum HangarError {
    #[error("Table not found: {0}")]
    NotFound(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Malformed ticket: {0}")]
    MalformedTicket(String),

    #[error("Malformed descriptor: {0}")]
    MalformedDescriptor(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    #[error("Peer disconnected: {0}")]
    Disconnected(String),

    #[error("Flow aborted: {0}")]
    Aborted(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("Flight error: {0}")]
    Flight(String),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Server error ({code:?}): {message}")]
    Remote { code: Code, message: String },
}

pub type Result<T> = std::result::Result<T, HangarError>;

impl HangarError {
    /// Stable, wire-visible code for this error
    pub fn code(&self) -> &'static str {
        match self {
            HangarError::NotFound(_) => "not_found",
            HangarError::SchemaMismatch(_) => "schema_mismatch",
            HangarError::InvalidSchema(_) => "invalid_schema",
            HangarError::MalformedTicket(_) => "malformed_ticket",
            HangarError::MalformedDescriptor(_) => "malformed_descriptor",
            HangarError::UnknownAction(_) => "unknown_action",
            HangarError::Unimplemented(_) => "unimplemented",
            HangarError::Disconnected(_) => "disconnected",
            HangarError::Aborted(_) => "aborted",
            HangarError::InvalidInput(_) => "invalid_input",
            HangarError::Arrow(_) => "arrow",
            HangarError::Flight(_) => "flight",
            HangarError::Transport(_) => "transport",
            HangarError::Io(_) => "io",
            HangarError::Serialization(_) => "serialization",
            HangarError::Remote { .. } => "remote",
        }
    }

    fn grpc_code(&self) -> Code {
        match self {
            HangarError::NotFound(_) => Code::NotFound,
            HangarError::SchemaMismatch(_) => Code::FailedPrecondition,
            HangarError::InvalidSchema(_)
            | HangarError::MalformedTicket(_)
            | HangarError::MalformedDescriptor(_)
            | HangarError::UnknownAction(_)
            | HangarError::InvalidInput(_) => Code::InvalidArgument,
            HangarError::Unimplemented(_) => Code::Unimplemented,
            HangarError::Disconnected(_) => Code::Cancelled,
            HangarError::Aborted(_) => Code::Aborted,
            HangarError::Remote { code, .. } => *code,
            _ => Code::Internal,
        }
    }

    fn detail(&self) -> Option<&str> {
        match self {
            HangarError::NotFound(d)
            | HangarError::SchemaMismatch(d)
            | HangarError::InvalidSchema(d)
            | HangarError::MalformedTicket(d)
            | HangarError::MalformedDescriptor(d)
            | HangarError::UnknownAction(d)
            | HangarError::Unimplemented(d)
            | HangarError::Disconnected(d)
            | HangarError::Aborted(d)
            | HangarError::InvalidInput(d) => Some(d),
            _ => None,
        }
    }

    /// Rebuild a typed error from a server-reported status.
    ///
    /// Statuses without the hangar metadata (foreign servers, transport
    /// failures) become `Remote`.
    pub fn from_status(status: &Status) -> Self {
        let metadata = status.metadata();
        let code = metadata
            .get(ERROR_CODE_KEY)
            .and_then(|v| v.to_str().ok());
        let detail = metadata
            .get_bin(ERROR_DETAIL_KEY)
            .and_then(|v| v.to_bytes().ok())
            .map(|b| String::from_utf8_lossy(&b).into_owned());

        let (code, detail) = match (code, detail) {
            (Some(code), Some(detail)) => (code, detail),
            _ => {
                return HangarError::Remote {
                    code: status.code(),
                    message: status.message().to_string(),
                }
            }
        };

        match code {
            "not_found" => HangarError::NotFound(detail),
            "schema_mismatch" => HangarError::SchemaMismatch(detail),
            "invalid_schema" => HangarError::InvalidSchema(detail),
            "malformed_ticket" => HangarError::MalformedTicket(detail),
            "malformed_descriptor" => HangarError::MalformedDescriptor(detail),
            "unknown_action" => HangarError::UnknownAction(detail),
            "unimplemented" => HangarError::Unimplemented(detail),
            "disconnected" => HangarError::Disconnected(detail),
            "aborted" => HangarError::Aborted(detail),
            "invalid_input" => HangarError::InvalidInput(detail),
            _ => HangarError::Remote {
                code: status.code(),
                message: status.message().to_string(),
            },
        }
    }
}

impl From<HangarError> for Status {
    fn from(err: HangarError) -> Self {
        let mut metadata = MetadataMap::new();
        if let Some(detail) = err.detail() {
            metadata.insert(ERROR_CODE_KEY, MetadataValue::from_static(err.code()));
            metadata.insert_bin(
                ERROR_DETAIL_KEY,
                MetadataValue::from_bytes(detail.as_bytes()),
            );
        }
        Status::with_metadata(err.grpc_code(), err.to_string(), metadata)
    }
}

impl From<Status> for HangarError {
    fn from(status: Status) -> Self {
        HangarError::from_status(&status)
    }
}

impl From<FlightError> for HangarError {
    fn from(err: FlightError) -> Self {
        match err {
            FlightError::Tonic(status) => HangarError::from_status(&status),
            FlightError::Arrow(e) => HangarError::Arrow(e),
            other => HangarError::Flight(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_keeps_variant() {
        let status: Status = HangarError::NotFound("cmd:chars".to_string()).into();
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status.message(), "Table not found: cmd:chars");

        match HangarError::from(status) {
            HangarError::NotFound(detail) => assert_eq!(detail, "cmd:chars"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_schema_mismatch_maps_to_failed_precondition() {
        let status: Status = HangarError::SchemaMismatch("field 0".to_string()).into();
        assert_eq!(status.code(), Code::FailedPrecondition);
        assert!(matches!(
            HangarError::from_status(&status),
            HangarError::SchemaMismatch(_)
        ));
    }

    #[test]
    fn test_foreign_status_becomes_remote() {
        let status = Status::unavailable("connection refused");
        match HangarError::from_status(&status) {
            HangarError::Remote { code, message } => {
                assert_eq!(code, Code::Unavailable);
                assert_eq!(message, "connection refused");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_non_ascii_detail_survives() {
        let status: Status = HangarError::NotFound("cmd:Übersicht".to_string()).into();
        match HangarError::from_status(&status) {
            HangarError::NotFound(detail) => assert_eq!(detail, "cmd:Übersicht"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
