use crate::codec::{decode_response, encode_command, DaemonRequest, DaemonResponse};
use crate::error::ErrorCode;
use crate::host::CapabilityHost;
use std::sync::Arc;
use tracing::{debug, warn};

/// Transport errors come back as `E_EXCEPTION` failures.
#[derive(Clone)]
pub struct DaemonChannel {
    host: Arc<dyn CapabilityHost>,
    binary: String,
}

impl DaemonChannel {
    pub fn new(host: Arc<dyn CapabilityHost>, binary: impl Into<String>) -> Self {
        Self {
            host,
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub async fn call(&self, request: &DaemonRequest) -> DaemonResponse {
        let command = encode_command(&self.binary, request);
        let verb = request.verb();
        let response = match self.host.execute(&command).await {
            Ok(output) => decode_response(&output),
            Err(err) => {
                warn!(event = "daemon.transport_error", verb, error = %err);
                DaemonResponse::failure(ErrorCode::Exception, err.to_string())
            }
        };
        match response.error() {
            None => debug!(event = "daemon.call_ok", verb),
            Some(failure) => debug!(
                event = "daemon.call_failed",
                verb,
                code = %failure.code,
                message = %failure.message
            ),
        }
        response
    }
}
