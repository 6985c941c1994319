//!
//! Porkbun implementation of the registry client.
//!
//! Every call is a `POST <api_base_url>/<endpoint>` with the API credentials
//! in the JSON body.
//!

mod types;

use std::time::Duration;

use async_trait::async_trait;
use ds_reconciler::{AnchorId, RegistryClient, RegistryError, RemoteAnchor, TrustAnchor};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use url::Url;

use crate::config::RegistrarToml;
use types::{
    ApiRequest, ApiResponse, CreateDnssecRecord, CreatedRecord, DnssecRecords, DomainList, Empty,
    ListAllDomains,
};

/// Maximum number of domains `domain/listAll` returns per page.
const DOMAIN_PAGE_SIZE: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum PorkbunBuildError {
    #[error("Porkbun API credentials are missing. Set registrar.api_key and registrar.secret_api_key.")]
    MissingCredentials,
    #[error("Failed to build the HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Porkbun JSON API v3 client.
#[derive(Clone)]
pub struct PorkbunClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: String,
    secret_api_key: String,
}

impl std::fmt::Debug for PorkbunClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PorkbunClient")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl PorkbunClient {
    pub fn new(
        base_url: Url,
        api_key: impl Into<String>,
        secret_api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, PorkbunBuildError> {
        let api_key = api_key.into();
        let secret_api_key = secret_api_key.into();
        if api_key.is_empty() || secret_api_key.is_empty() {
            return Err(PorkbunBuildError::MissingCredentials);
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url,
            api_key,
            secret_api_key,
        })
    }

    pub fn from_config(config: &RegistrarToml) -> Result<Self, PorkbunBuildError> {
        Self::new(
            config.api_base_url.clone(),
            config.api_key.clone(),
            config.secret_api_key.clone(),
            Duration::from_millis(config.timeout_ms.get()),
        )
    }

    fn endpoint_url(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            endpoint
        )
    }

    /// Sends one request and decodes the `status`-tagged response.
    async fn call<P, T>(&self, endpoint: &str, payload: P) -> Result<T, RegistryError>
    where
        P: Serialize,
        T: DeserializeOwned,
    {
        let (status, text) = self.send(endpoint, payload).await?;
        decode(endpoint, status, &text)
    }

    /// Sends one request. Rate limiting, server errors and rejected credentials
    /// are mapped here, everything else is left to the caller.
    async fn send<P>(&self, endpoint: &str, payload: P) -> Result<(StatusCode, String), RegistryError>
    where
        P: Serialize,
    {
        let body = ApiRequest {
            apikey: &self.api_key,
            secretapikey: &self.secret_api_key,
            payload,
        };
        let response = self
            .http
            .post(self.endpoint_url(endpoint))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(endpoint, e))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(RegistryError::Unavailable(format!("{endpoint}: HTTP {status}")));
        }

        let text = response
            .text()
            .await
            .map_err(|e| transport_error(endpoint, e))?;

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let message = match serde_json::from_str::<ApiResponse<Empty>>(&text) {
                Ok(ApiResponse::Error { message }) if !message.is_empty() => message,
                _ => format!("HTTP {status}"),
            };
            return Err(RegistryError::AuthFailure(format!("{endpoint}: {message}")));
        }
        Ok((status, text))
    }

    /// All domains of the account.
    pub async fn list_domains(&self) -> Result<Vec<String>, RegistryError> {
        let mut domains = vec![];
        loop {
            let page: DomainList = self
                .call(
                    "domain/listAll",
                    ListAllDomains {
                        start: domains.len().to_string(),
                        include_labels: "no",
                    },
                )
                .await?;
            let count = page.domains.len();
            domains.extend(page.domains.into_iter().map(|entry| entry.domain));
            if count < DOMAIN_PAGE_SIZE {
                break;
            }
        }
        tracing::debug!("Porkbun account holds {} domains.", domains.len());
        Ok(domains)
    }
}

fn decode<T: DeserializeOwned>(
    endpoint: &str,
    status: StatusCode,
    text: &str,
) -> Result<T, RegistryError> {
    match serde_json::from_str::<ApiResponse<T>>(text) {
        Ok(ApiResponse::Success(value)) if status.is_success() => Ok(value),
        Ok(ApiResponse::Success(_)) => Err(RegistryError::UnexpectedResponse(format!(
            "{endpoint}: SUCCESS with HTTP {status}"
        ))),
        Ok(ApiResponse::Error { message }) => Err(classify_error_message(endpoint, message)),
        Err(_) if !status.is_success() => {
            Err(RegistryError::Rejected(format!("{endpoint}: HTTP {status}")))
        }
        Err(e) => Err(RegistryError::UnexpectedResponse(format!("{endpoint}: {e}"))),
    }
}

fn transport_error(endpoint: &str, e: reqwest::Error) -> RegistryError {
    if e.is_timeout() {
        RegistryError::Unavailable(format!("{endpoint}: request timed out"))
    } else {
        RegistryError::Unavailable(format!("{endpoint}: {e}"))
    }
}

/// Maps an `ERROR` response onto the registry error taxonomy.
fn classify_error_message(endpoint: &str, message: String) -> RegistryError {
    let lower = message.to_lowercase();
    if lower.contains("api key") || lower.contains("apikey") {
        RegistryError::AuthFailure(format!("{endpoint}: {message}"))
    } else {
        RegistryError::Rejected(format!("{endpoint}: {message}"))
    }
}

/// A delete that failed because the record is already gone. Only a 404 or an
/// error message about the record itself count. "Domain not found" does not.
fn is_missing_record(status: StatusCode, text: &str) -> bool {
    if status == StatusCode::NOT_FOUND {
        return true;
    }
    let Ok(ApiResponse::Error { message }) = serde_json::from_str::<ApiResponse<Empty>>(text) else {
        return false;
    };
    let lower = message.to_lowercase();
    lower.contains("record") && (lower.contains("not found") || lower.contains("does not exist"))
}

#[async_trait]
impl RegistryClient for PorkbunClient {
    async fn list_trust_anchors(&self, domain: &str) -> Result<Vec<RemoteAnchor>, RegistryError> {
        let endpoint = format!("dns/getDnssecRecords/{domain}");
        let records: DnssecRecords = self.call(&endpoint, Empty {}).await?;
        records
            .into_remote_anchors()
            .map_err(|e| RegistryError::UnexpectedResponse(format!("{endpoint}: {e}")))
    }

    async fn create_trust_anchor(
        &self,
        domain: &str,
        anchor: &TrustAnchor,
    ) -> Result<Option<AnchorId>, RegistryError> {
        let endpoint = format!("dns/createDnssecRecord/{domain}");
        let created: CreatedRecord = self
            .call(&endpoint, CreateDnssecRecord::from(anchor))
            .await?;
        Ok(created.anchor_id())
    }

    async fn delete_trust_anchor(&self, domain: &str, id: &AnchorId) -> Result<(), RegistryError> {
        let endpoint = format!("dns/deleteDnssecRecord/{domain}/{id}");
        let (status, text) = self.send(&endpoint, Empty {}).await?;
        if is_missing_record(status, &text) {
            tracing::debug!("{domain} DS record {id} is already gone: HTTP {status}");
            return Ok(());
        }
        decode::<Empty>(&endpoint, status, &text).map(|_| ())
    }
}
