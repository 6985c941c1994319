//! In-memory collaborators for the tests of this crate.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use hickory_proto::{
    op::{Message, ResponseCode},
    rr::RecordType,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    task::JoinHandle,
};

use crate::{
    anchor::{SigningKey, TrustAnchor},
    key_source::{KeySource, KeySourceError},
    registry::{AnchorId, RegistryClient, RegistryError, RemoteAnchor},
};

/// Registrar call as seen by [`MemoryRegistry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    List(String),
    Create(String, TrustAnchor),
    Delete(String, AnchorId),
}

/// Registrar double that keeps its records in memory and records every call.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    records: Mutex<HashMap<String, BTreeMap<AnchorId, TrustAnchor>>>,
    calls: Mutex<Vec<Call>>,
    next_id: AtomicUsize,
    failing_creates: Mutex<HashMap<TrustAnchor, RegistryError>>,
    failing_deletes: Mutex<HashMap<AnchorId, RegistryError>>,
    failing_lists: Mutex<HashMap<String, RegistryError>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicUsize::new(1000),
            ..Default::default()
        }
    }

    pub fn insert(&self, domain: &str, id: &str, anchor: TrustAnchor) {
        self.records
            .lock()
            .unwrap()
            .entry(domain.to_string())
            .or_default()
            .insert(AnchorId::new(id), anchor);
    }

    pub fn fail_create(&self, anchor: TrustAnchor, error: RegistryError) {
        self.failing_creates.lock().unwrap().insert(anchor, error);
    }

    pub fn fail_delete(&self, id: &str, error: RegistryError) {
        self.failing_deletes
            .lock()
            .unwrap()
            .insert(AnchorId::new(id), error);
    }

    pub fn fail_list(&self, domain: &str, error: RegistryError) {
        self.failing_lists
            .lock()
            .unwrap()
            .insert(domain.to_string(), error);
    }

    pub fn anchors(&self, domain: &str) -> HashSet<TrustAnchor> {
        self.records
            .lock()
            .unwrap()
            .get(domain)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls that mutate the registrar, in order.
    pub fn mutations(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| !matches!(call, Call::List(_)))
            .collect()
    }
}

#[async_trait]
impl RegistryClient for MemoryRegistry {
    async fn list_trust_anchors(&self, domain: &str) -> Result<Vec<RemoteAnchor>, RegistryError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::List(domain.to_string()));
        if let Some(error) = self.failing_lists.lock().unwrap().get(domain) {
            return Err(error.clone());
        }
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(domain)
            .map(|records| {
                records
                    .iter()
                    .map(|(id, anchor)| RemoteAnchor::new(anchor.clone(), id.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_trust_anchor(
        &self,
        domain: &str,
        anchor: &TrustAnchor,
    ) -> Result<Option<AnchorId>, RegistryError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Create(domain.to_string(), anchor.clone()));
        if let Some(error) = self.failing_creates.lock().unwrap().get(anchor) {
            return Err(error.clone());
        }
        let id = AnchorId::new(self.next_id.fetch_add(1, Ordering::SeqCst).to_string());
        self.records
            .lock()
            .unwrap()
            .entry(domain.to_string())
            .or_default()
            .insert(id.clone(), anchor.clone());
        Ok(Some(id))
    }

    async fn delete_trust_anchor(&self, domain: &str, id: &AnchorId) -> Result<(), RegistryError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Delete(domain.to_string(), id.clone()));
        if let Some(error) = self.failing_deletes.lock().unwrap().get(id) {
            return Err(error.clone());
        }
        if let Some(records) = self.records.lock().unwrap().get_mut(domain) {
            records.remove(id);
        }
        Ok(())
    }
}

/// Key source answering from a fixed table. Unknown domains fail like an
/// unreachable resolver.
#[derive(Debug, Default)]
pub struct StaticKeySource {
    keys: HashMap<String, Vec<SigningKey>>,
}

impl StaticKeySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keys(mut self, domain: &str, keys: Vec<SigningKey>) -> Self {
        self.keys.insert(domain.to_string(), keys);
        self
    }
}

#[async_trait]
impl KeySource for StaticKeySource {
    async fn query_keys(&self, domain: &str) -> Result<Vec<SigningKey>, KeySourceError> {
        match self.keys.get(domain) {
            Some(keys) if keys.is_empty() => Err(KeySourceError::EmptyResult),
            Some(keys) => Ok(keys.clone()),
            None => Err(KeySourceError::Transport(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "resolver unreachable",
            ))),
        }
    }
}

/// Ways [`FakeDnsServer`] can spoil an otherwise valid answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tamper {
    pub wrong_id: bool,
    pub truncated: bool,
    pub not_a_response: bool,
}

/// Minimal authoritative server answering DNSKEY queries over TCP.
pub struct FakeDnsServer {
    pub addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl FakeDnsServer {
    pub async fn start(keys: Vec<SigningKey>, rcode: ResponseCode) -> Self {
        let rdatas = keys.iter().map(SigningKey::to_rdata).collect();
        Self::start_raw(rdatas, rcode, Tamper::default()).await
    }

    /// Answers with the given DNSKEY RDATA verbatim.
    pub async fn start_raw(rdatas: Vec<Vec<u8>>, rcode: ResponseCode, tamper: Tamper) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let length = stream.read_u16().await.unwrap();
                let mut query = vec![0u8; length as usize];
                stream.read_exact(&mut query).await.unwrap();

                let parsed = Message::from_vec(&query).unwrap();
                assert_eq!(parsed.queries()[0].query_type(), RecordType::DNSKEY);

                let response = answer(&query, &rdatas, u16::from(rcode) as u8, tamper);
                stream.write_u16(response.len() as u16).await.unwrap();
                stream.write_all(&response).await.unwrap();
            }
        });
        Self { addr, handle }
    }

    /// Accepts connections but never answers.
    pub async fn start_silent() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                open.push(stream);
            }
        });
        Self { addr, handle }
    }
}

impl Drop for FakeDnsServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Builds a response to `query` carrying one DNSKEY answer per RDATA.
fn answer(query: &[u8], rdatas: &[Vec<u8>], rcode: u8, tamper: Tamper) -> Vec<u8> {
    let mut question_end = 12;
    while query[question_end] != 0 {
        question_end += 1 + query[question_end] as usize;
    }
    // Root label, QTYPE and QCLASS.
    question_end += 5;

    let mut response = query[..question_end].to_vec();
    if !tamper.not_a_response {
        response[2] |= 0x80;
    }
    if tamper.truncated {
        response[2] |= 0x02;
    }
    if tamper.wrong_id {
        let id = u16::from_be_bytes([response[0], response[1]]).wrapping_add(1);
        response[0..2].copy_from_slice(&id.to_be_bytes());
    }
    response[3] = (response[3] & 0xF0) | (rcode & 0x0F);
    response[6..8].copy_from_slice(&(rdatas.len() as u16).to_be_bytes());
    response[8..12].copy_from_slice(&[0, 0, 0, 0]);

    for rdata in rdatas {
        // Compression pointer to the question name.
        response.extend_from_slice(&[0xC0, 0x0C]);
        response.extend_from_slice(&u16::from(RecordType::DNSKEY).to_be_bytes());
        response.extend_from_slice(&1u16.to_be_bytes());
        response.extend_from_slice(&3600u32.to_be_bytes());
        response.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        response.extend_from_slice(rdata);
    }
    response
}
