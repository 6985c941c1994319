//! Request and response bodies of the Porkbun JSON API v3.

use std::{collections::BTreeMap, fmt::Display, str::FromStr};

use ds_reconciler::{AnchorId, RemoteAnchor, TrustAnchor};
use serde::{
    de::{DeserializeOwned, IgnoredAny},
    Deserialize, Deserializer, Serialize,
};

/// Every request carries the credentials next to the endpoint specific fields.
#[derive(Serialize)]
pub(crate) struct ApiRequest<'a, P: Serialize> {
    pub apikey: &'a str,
    pub secretapikey: &'a str,
    #[serde(flatten)]
    pub payload: P,
}

/// Body without endpoint specific fields.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Empty {}

#[derive(Debug, Serialize)]
pub(crate) struct CreateDnssecRecord {
    #[serde(rename = "keyTag")]
    pub key_tag: String,
    pub alg: String,
    #[serde(rename = "digestType")]
    pub digest_type: String,
    /// Upper case hex.
    pub digest: String,
}

impl From<&TrustAnchor> for CreateDnssecRecord {
    fn from(anchor: &TrustAnchor) -> Self {
        Self {
            key_tag: anchor.key_tag.to_string(),
            alg: anchor.algorithm.to_string(),
            digest_type: anchor.digest_type.to_string(),
            digest: anchor.digest_hex(),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ListAllDomains {
    /// Offset, as a decimal string.
    pub start: String,
    #[serde(rename = "includeLabels")]
    pub include_labels: &'static str,
}

/// Top level shape of every response.
#[derive(Debug, Deserialize)]
#[serde(tag = "status")]
#[serde(bound = "T: DeserializeOwned")]
pub(crate) enum ApiResponse<T> {
    #[serde(rename = "SUCCESS")]
    Success(T),
    #[serde(rename = "ERROR")]
    Error {
        #[serde(default)]
        message: String,
    },
}

#[derive(Debug, Deserialize)]
pub(crate) struct DnssecRecords {
    #[serde(default)]
    pub records: Records,
}

/// The API sends a map keyed by record id, or an empty array when there are none.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum Records {
    ById(BTreeMap<String, DnssecRecord>),
    List(Vec<IgnoredAny>),
}

impl Default for Records {
    fn default() -> Self {
        Records::List(vec![])
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct DnssecRecord {
    #[serde(rename = "keyTag", deserialize_with = "number")]
    pub key_tag: u16,
    #[serde(deserialize_with = "number")]
    pub alg: u8,
    #[serde(rename = "digestType", deserialize_with = "number")]
    pub digest_type: u8,
    pub digest: String,
}

impl DnssecRecords {
    /// Converts the records into anchors. Fails on a digest that isn't hex.
    pub fn into_remote_anchors(self) -> Result<Vec<RemoteAnchor>, String> {
        let records = match self.records {
            Records::ById(records) => records,
            Records::List(list) if list.is_empty() => return Ok(vec![]),
            Records::List(list) => {
                return Err(format!("expected records by id, got a list of {}", list.len()))
            }
        };
        records
            .into_iter()
            .map(|(id, record)| {
                let digest = hex::decode(record.digest.trim())
                    .map_err(|e| format!("record {id} has an invalid digest: {e}"))?;
                let anchor =
                    TrustAnchor::new(record.key_tag, record.alg, record.digest_type, digest);
                Ok(RemoteAnchor::new(anchor, AnchorId::new(id)))
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreatedRecord {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
}

impl CreatedRecord {
    pub fn anchor_id(&self) -> Option<AnchorId> {
        match self.id.as_ref()? {
            serde_json::Value::String(id) => Some(AnchorId::new(id.clone())),
            serde_json::Value::Number(id) => Some(AnchorId::new(id.to_string())),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct DomainList {
    #[serde(default)]
    pub domains: Vec<DomainEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DomainEntry {
    pub domain: String,
}

/// Numbers come either as JSON numbers or as decimal strings.
fn number<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    let text = match Raw::deserialize(deserializer)? {
        Raw::Number(n) => n.to_string(),
        Raw::Text(s) => s,
    };
    text.trim().parse().map_err(serde::de::Error::custom)
}
