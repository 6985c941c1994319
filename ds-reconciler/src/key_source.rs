//!
//! Fetches the DNSKEY set of a zone from an authoritative server.
//!
//! The query always goes over TCP. A zone in the middle of a rollover can publish
//! enough keys to exceed what fits in a single UDP datagram.
//!

use std::{fmt, net::SocketAddr, time::Duration};

use async_trait::async_trait;
use hickory_proto::{
    error::ProtoError,
    op::{Header, Message, MessageType, OpCode, Query, ResponseCode},
    rr::{DNSClass, Name, RecordType},
    serialize::binary::{BinDecodable, BinDecoder, BinEncodable},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::anchor::{fqdn, SigningKey};

#[derive(thiserror::Error, Debug)]
pub enum KeySourceError {
    #[error("DNSKEY lookup via {resolver} timed out after {timeout:?}.")]
    Timeout {
        resolver: SocketAddr,
        timeout: Duration,
    },
    #[error("DNSKEY lookup failed: {0}")]
    Transport(#[from] std::io::Error),
    #[error("Malformed DNS message: {0}")]
    Malformed(#[from] ProtoError),
    #[error("Unexpected DNS response: {0}")]
    UnexpectedResponse(String),
    #[error("Resolver answered with {0}.")]
    ResponseCode(ResponseCode),
    #[error("'{0}' is not a valid domain name.")]
    InvalidName(String),
    #[error("The zone publishes no DNSKEY records.")]
    EmptyResult,
}

impl KeySourceError {
    /// The zone answered but has no keys. Not necessarily an error for the caller.
    pub fn is_empty_result(&self) -> bool {
        matches!(self, KeySourceError::EmptyResult)
    }

    /// Anything that prevented us from learning the key set.
    pub fn is_lookup_failure(&self) -> bool {
        !self.is_empty_result()
    }
}

/// Source of the signing keys a domain currently publishes.
#[async_trait]
pub trait KeySource: Send + Sync {
    /// Returns every DNSKEY published at the apex of `domain`.
    async fn query_keys(&self, domain: &str) -> Result<Vec<SigningKey>, KeySourceError>;
}

/// Queries DNSKEY records over TCP from a single resolver or authoritative server.
#[derive(Debug, Clone)]
pub struct DnsKeySource {
    resolver: SocketAddr,
    timeout: Duration,
}

impl DnsKeySource {
    pub fn new(resolver: SocketAddr, timeout: Duration) -> Self {
        Self { resolver, timeout }
    }

    pub fn resolver(&self) -> SocketAddr {
        self.resolver
    }

    fn build_query(name: &Name) -> Message {
        let mut query = Query::query(name.clone(), RecordType::DNSKEY);
        query.set_query_class(DNSClass::IN);
        let mut message = Message::new();
        message
            .set_id(rand::random())
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(query);
        message
    }

    /// One query/response exchange with the two-byte length framing of RFC 1035 §4.2.2.
    async fn exchange(&self, request: &[u8]) -> Result<Vec<u8>, KeySourceError> {
        let length = u16::try_from(request.len()).map_err(|_| {
            KeySourceError::UnexpectedResponse("query exceeds 65535 bytes".to_string())
        })?;
        let mut stream = TcpStream::connect(self.resolver).await?;
        stream.write_u16(length).await?;
        stream.write_all(request).await?;
        stream.flush().await?;

        let response_length = stream.read_u16().await?;
        let mut response = vec![0u8; response_length as usize];
        stream.read_exact(&mut response).await?;
        Ok(response)
    }

    /// Validates the response header and collects the DNSKEY answers for `name`.
    ///
    /// The answer section is walked on the wire format so every key keeps the
    /// exact RDATA the zone publishes. Key tags and digests are computed over
    /// those bytes.
    fn extract_keys(
        name: &Name,
        request_id: u16,
        response: &[u8],
    ) -> Result<Vec<SigningKey>, KeySourceError> {
        let mut decoder = BinDecoder::new(response);
        let header = Header::read(&mut decoder)?;
        if header.id() != request_id {
            return Err(KeySourceError::UnexpectedResponse(format!(
                "response id {} does not match query id {request_id}",
                header.id()
            )));
        }
        if header.message_type() != MessageType::Response {
            return Err(KeySourceError::UnexpectedResponse(
                "received a query instead of a response".to_string(),
            ));
        }
        if header.response_code() != ResponseCode::NoError {
            return Err(KeySourceError::ResponseCode(header.response_code()));
        }
        if header.truncated() {
            return Err(KeySourceError::UnexpectedResponse(
                "response is truncated".to_string(),
            ));
        }

        for _ in 0..header.query_count() {
            Query::read(&mut decoder)?;
        }

        let mut keys = Vec::new();
        for _ in 0..header.answer_count() {
            let owner = Name::read(&mut decoder)?;
            let record_type = RecordType::from(decoder.read_u16().map_err(malformed)?.unverified());
            // Class and TTL.
            decoder.read_u16().map_err(malformed)?;
            decoder.read_u32().map_err(malformed)?;
            let length = decoder.read_u16().map_err(malformed)?.unverified();
            let rdata = decoder
                .read_slice(length as usize)
                .map_err(malformed)?
                .unverified();

            if record_type != RecordType::DNSKEY || &owner != name {
                continue;
            }
            let key = SigningKey::from_rdata(rdata).ok_or_else(|| {
                KeySourceError::UnexpectedResponse(format!(
                    "DNSKEY RDATA of {} bytes is too short",
                    rdata.len()
                ))
            })?;
            keys.push(key);
        }

        if keys.is_empty() {
            return Err(KeySourceError::EmptyResult);
        }
        Ok(keys)
    }
}

fn malformed(e: impl fmt::Display) -> KeySourceError {
    KeySourceError::UnexpectedResponse(format!("malformed answer section: {e}"))
}

#[async_trait]
impl KeySource for DnsKeySource {
    async fn query_keys(&self, domain: &str) -> Result<Vec<SigningKey>, KeySourceError> {
        let name = fqdn(domain).map_err(|_| KeySourceError::InvalidName(domain.to_string()))?;
        let request = Self::build_query(&name);
        let bytes = request.to_vec()?;

        tracing::debug!("Query DNSKEY {name} from {} over TCP.", self.resolver);
        let response = tokio::time::timeout(self.timeout, self.exchange(&bytes))
            .await
            .map_err(|_| KeySourceError::Timeout {
                resolver: self.resolver,
                timeout: self.timeout,
            })??;
        let keys = Self::extract_keys(&name, request.id(), &response)?;
        tracing::debug!("{name} publishes {} DNSKEY records.", keys.len());
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        anchor::AnchorDeriver,
        test_utils::{FakeDnsServer, Tamper},
    };

    async fn lookup_with(tamper: Tamper, rdatas: Vec<Vec<u8>>) -> KeySourceError {
        let server = FakeDnsServer::start_raw(rdatas, ResponseCode::NoError, tamper).await;
        let source = DnsKeySource::new(server.addr, Duration::from_secs(2));
        source.query_keys("example.com").await.unwrap_err()
    }

    #[tokio::test]
    async fn returns_all_published_keys() {
        let ksk = SigningKey::new(257, 13, vec![1; 64]);
        let zsk = SigningKey::new(256, 13, vec![2; 64]);
        let server = FakeDnsServer::start(vec![ksk.clone(), zsk.clone()], ResponseCode::NoError)
            .await;

        let source = DnsKeySource::new(server.addr, Duration::from_secs(2));
        let keys = source.query_keys("example.com").await.unwrap();

        assert_eq!(keys, vec![ksk.clone(), zsk]);
        assert_eq!(keys.iter().filter(|k| k.is_key_signing_key()).count(), 1);
    }

    #[tokio::test]
    async fn many_keys_fit_over_tcp() {
        // Well above 512 bytes, the classic UDP limit.
        let keys: Vec<SigningKey> = (0..12)
            .map(|i| SigningKey::new(257, 8, vec![i as u8; 260]))
            .collect();
        let server = FakeDnsServer::start(keys.clone(), ResponseCode::NoError).await;

        let source = DnsKeySource::new(server.addr, Duration::from_secs(2));
        let fetched = source.query_keys("example.com.").await.unwrap();
        assert_eq!(fetched, keys);
    }

    #[tokio::test]
    async fn no_keys_is_empty_result() {
        let server = FakeDnsServer::start(vec![], ResponseCode::NoError).await;

        let source = DnsKeySource::new(server.addr, Duration::from_secs(2));
        let err = source.query_keys("example.com").await.unwrap_err();
        assert!(err.is_empty_result());
        assert!(!err.is_lookup_failure());
    }

    #[tokio::test]
    async fn error_rcode_is_lookup_failure() {
        let server = FakeDnsServer::start(vec![], ResponseCode::ServFail).await;

        let source = DnsKeySource::new(server.addr, Duration::from_secs(2));
        let err = source.query_keys("example.com").await.unwrap_err();
        assert!(matches!(err, KeySourceError::ResponseCode(ResponseCode::ServFail)));
        assert!(err.is_lookup_failure());
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let server = FakeDnsServer::start_silent().await;

        let source = DnsKeySource::new(server.addr, Duration::from_millis(200));
        let err = source.query_keys("example.com").await.unwrap_err();
        assert!(matches!(err, KeySourceError::Timeout { .. }));
        assert!(err.is_lookup_failure());
    }

    #[tokio::test]
    async fn unreachable_resolver_is_lookup_failure() {
        // Bind and drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let source = DnsKeySource::new(addr, Duration::from_secs(2));
        let err = source.query_keys("example.com").await.unwrap_err();
        assert!(err.is_lookup_failure());
    }

    #[tokio::test]
    async fn keeps_flags_exactly_as_published() {
        // KSK flags plus an unassigned bit.
        let odd = SigningKey::new(257 | 0x0002, 13, vec![1; 64]);
        let server = FakeDnsServer::start(vec![odd.clone()], ResponseCode::NoError).await;

        let source = DnsKeySource::new(server.addr, Duration::from_secs(2));
        let keys = source.query_keys("example.com").await.unwrap();

        assert_eq!(keys[0].flags, 259);
        assert_eq!(keys[0].key_tag(), odd.key_tag());
        assert!(!keys[0].is_key_signing_key());
        let desired = AnchorDeriver::default()
            .desired_set("example.com", &keys)
            .unwrap();
        assert!(desired.is_empty());
    }

    #[tokio::test]
    async fn mismatched_id_is_lookup_failure() {
        let key = SigningKey::new(257, 13, vec![1; 64]);
        let tamper = Tamper {
            wrong_id: true,
            ..Default::default()
        };
        let err = lookup_with(tamper, vec![key.to_rdata()]).await;
        assert!(matches!(err, KeySourceError::UnexpectedResponse(_)));
        assert!(err.is_lookup_failure());
    }

    #[tokio::test]
    async fn query_echoed_back_is_lookup_failure() {
        let key = SigningKey::new(257, 13, vec![1; 64]);
        let tamper = Tamper {
            not_a_response: true,
            ..Default::default()
        };
        let err = lookup_with(tamper, vec![key.to_rdata()]).await;
        assert!(matches!(err, KeySourceError::UnexpectedResponse(_)));
        assert!(err.is_lookup_failure());
    }

    #[tokio::test]
    async fn truncated_response_is_lookup_failure() {
        let key = SigningKey::new(257, 13, vec![1; 64]);
        let tamper = Tamper {
            truncated: true,
            ..Default::default()
        };
        let err = lookup_with(tamper, vec![key.to_rdata()]).await;
        assert!(matches!(err, KeySourceError::UnexpectedResponse(_)));
        assert!(err.is_lookup_failure());
    }

    #[tokio::test]
    async fn short_rdata_is_lookup_failure() {
        let err = lookup_with(Tamper::default(), vec![vec![1, 1, 3]]).await;
        assert!(matches!(err, KeySourceError::UnexpectedResponse(_)));
        assert!(err.is_lookup_failure());
    }
}
