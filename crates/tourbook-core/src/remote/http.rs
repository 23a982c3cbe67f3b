//! `RemoteStore` over HTTP/JSON, speaking to `tourbook-api`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use super::protocol::{
    ConflictBody, DeltaResponse, ErrorBody, OutgoingRecord, UpsertAccepted, UpsertRequest,
    WORKSPACE_HEADER,
};
use super::{RemoteError, RemoteStore, UpsertOutcome};
use crate::config::RemoteConfig;
use crate::models::{EntityType, RemoteRecord, WorkspaceId};

/// HTTP client for the reference remote store
#[derive(Debug, Clone)]
pub struct HttpRemoteStore {
    client: reqwest::Client,
    config: RemoteConfig,
}

impl HttpRemoteStore {
    /// Build a client whose every request is bounded by `timeout`
    pub fn new(config: RemoteConfig, timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|error| RemoteError::Network(error.to_string()))?;
        Ok(Self { client, config })
    }

    pub const fn config(&self) -> &RemoteConfig {
        &self.config
    }

    fn records_url(&self, entity_type: &EntityType) -> String {
        format!("{}/v1/records/{entity_type}", self.config.base_url)
    }

    fn scoped(
        &self,
        builder: reqwest::RequestBuilder,
        workspace: &WorkspaceId,
    ) -> reqwest::RequestBuilder {
        let builder = builder.header(WORKSPACE_HEADER, workspace.as_str());
        match &self.config.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

fn transport_error(error: &reqwest::Error) -> RemoteError {
    if error.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Network(error.to_string())
    }
}

fn decode_error(error: &reqwest::Error) -> RemoteError {
    if error.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Protocol(error.to_string())
    }
}

async fn error_message(response: reqwest::Response) -> String {
    let status = response.status();
    response
        .json::<ErrorBody>()
        .await
        .map_or_else(|_| status.to_string(), |body| body.error)
}

/// Map a non-success status that carries no sync outcome
fn classify_failure(status: StatusCode, message: String) -> RemoteError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Unauthorized(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => RemoteError::Unavailable {
            status: status.as_u16(),
            message,
        },
        status if status.is_server_error() => RemoteError::Unavailable {
            status: status.as_u16(),
            message,
        },
        _ => RemoteError::Rejected(message),
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn upsert(
        &self,
        entity_type: &EntityType,
        workspace: &WorkspaceId,
        record: &OutgoingRecord,
        basis_version: i64,
    ) -> Result<UpsertOutcome, RemoteError> {
        let body = UpsertRequest {
            record: record.clone(),
            basis_version,
        };
        let response = self
            .scoped(self.client.post(self.records_url(entity_type)), workspace)
            .json(&body)
            .send()
            .await
            .map_err(|error| transport_error(&error))?;

        match response.status() {
            status if status.is_success() => {
                let accepted: UpsertAccepted = response
                    .json()
                    .await
                    .map_err(|error| decode_error(&error))?;
                Ok(UpsertOutcome::Accepted {
                    canonical_code: accepted.canonical_code,
                    version: accepted.version,
                    server_timestamp: accepted.server_timestamp,
                })
            }
            StatusCode::CONFLICT => {
                let conflict: ConflictBody = response
                    .json()
                    .await
                    .map_err(|error| decode_error(&error))?;
                Ok(UpsertOutcome::Conflict(conflict.remote))
            }
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                Ok(UpsertOutcome::Rejected {
                    reason: error_message(response).await,
                })
            }
            status => Err(classify_failure(status, error_message(response).await)),
        }
    }

    async fn query_updated_since(
        &self,
        entity_type: &EntityType,
        workspace: &WorkspaceId,
        since: Option<i64>,
    ) -> Result<Vec<RemoteRecord>, RemoteError> {
        let mut request = self.client.get(self.records_url(entity_type));
        if let Some(since) = since {
            request = request.query(&[("since", since)]);
        }
        let response = self
            .scoped(request, workspace)
            .send()
            .await
            .map_err(|error| transport_error(&error))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_failure(status, error_message(response).await));
        }

        let delta: DeltaResponse = response
            .json()
            .await
            .map_err(|error| decode_error(&error))?;
        Ok(delta.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_url_joins_entity_type() {
        let config = RemoteConfig::new("http://127.0.0.1:8080/").unwrap();
        let store = HttpRemoteStore::new(config, Duration::from_secs(1)).unwrap();
        assert_eq!(
            store.records_url(&EntityType::new("orders").unwrap()),
            "http://127.0.0.1:8080/v1/records/orders"
        );
    }

    #[test]
    fn failure_statuses_map_to_error_classes() {
        assert!(classify_failure(StatusCode::SERVICE_UNAVAILABLE, String::new()).is_transient());
        assert!(classify_failure(StatusCode::TOO_MANY_REQUESTS, String::new()).is_transient());
        assert!(matches!(
            classify_failure(StatusCode::UNAUTHORIZED, String::new()),
            RemoteError::Unauthorized(_)
        ));
        assert!(classify_failure(StatusCode::NOT_FOUND, String::new()).is_permanent());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreachable_server_is_transient() {
        // Port 9 (discard) is closed on test machines
        let config = RemoteConfig::new("http://127.0.0.1:9").unwrap();
        let store = HttpRemoteStore::new(config, Duration::from_millis(500)).unwrap();
        let err = store
            .query_updated_since(
                &EntityType::new("tours").unwrap(),
                &WorkspaceId::new("ws-a").unwrap(),
                None,
            )
            .await
            .unwrap_err();
        assert!(err.is_transient(), "unexpected error {err:?}");
    }
}
