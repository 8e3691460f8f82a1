//! Attestation document parsing.
//!
//! The hardware hands back a CBOR COSE_Sign1 structure: a four-element
//! array whose third element is the byte-string payload, itself a CBOR
//! map carrying the module id and the PCR measurement table. Only the
//! payload is consumed here; signature validation over the AWS root of
//! trust happens on the verifying side, not inside the enclave.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use ciborium::value::Value;

use crate::error::{AttestError, AttestResult};

/// Parsed payload of an attestation document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationDoc {
    pub module_id: String,
    /// PCR index to 48-byte measurement.
    pub pcrs: BTreeMap<u8, Vec<u8>>,
}

impl AttestationDoc {
    pub fn parse(raw: &[u8]) -> AttestResult<Self> {
        let value: Value = ciborium::de::from_reader(raw)
            .map_err(|e| AttestError::BadDocument(e.to_string()))?;
        // the document may arrive wrapped in CBOR tag 18 (COSE_Sign1)
        let value = match value {
            Value::Tag(18, inner) => *inner,
            other => other,
        };
        let Value::Array(cose) = value else {
            return Err(AttestError::BadDocument("not a COSE array".into()));
        };
        if cose.len() != 4 {
            return Err(AttestError::BadDocument(format!(
                "COSE array of {} elements",
                cose.len()
            )));
        }
        let Some(Value::Bytes(payload)) = cose.get(2) else {
            return Err(AttestError::BadDocument("payload is not bytes".into()));
        };
        Self::parse_payload(payload)
    }

    pub fn parse_base64(encoded: &str) -> AttestResult<Self> {
        let raw = B64
            .decode(encoded)
            .map_err(|e| AttestError::BadDocument(e.to_string()))?;
        Self::parse(&raw)
    }

    fn parse_payload(payload: &[u8]) -> AttestResult<Self> {
        let value: Value = ciborium::de::from_reader(payload)
            .map_err(|e| AttestError::BadDocument(e.to_string()))?;
        let Value::Map(entries) = value else {
            return Err(AttestError::BadDocument("payload is not a map".into()));
        };

        let mut module_id = None;
        let mut pcrs = BTreeMap::new();
        for (key, val) in entries {
            match (key, val) {
                (Value::Text(k), Value::Text(v)) if k == "module_id" => {
                    module_id = Some(v);
                }
                (Value::Text(k), Value::Map(table)) if k == "pcrs" => {
                    for (idx, measurement) in table {
                        let (Value::Integer(idx), Value::Bytes(bytes)) = (idx, measurement)
                        else {
                            return Err(AttestError::BadDocument("bad pcr entry".into()));
                        };
                        let idx = u8::try_from(idx)
                            .map_err(|_| AttestError::BadDocument("bad pcr index".into()))?;
                        pcrs.insert(idx, bytes);
                    }
                }
                _ => {}
            }
        }

        Ok(Self {
            module_id: module_id
                .ok_or_else(|| AttestError::BadDocument("no module_id".into()))?,
            pcrs,
        })
    }

    pub fn pcr(&self, idx: u8) -> Option<&[u8]> {
        self.pcrs.get(&idx).map(Vec::as_slice)
    }

    pub fn pcr_hex(&self, idx: u8) -> AttestResult<String> {
        self.pcr(idx)
            .map(hex::encode)
            .ok_or(AttestError::MissingPcr(idx))
    }

    /// An all-zero (or absent) PCR0 marks a debug, unmeasured enclave.
    pub fn is_debug(&self) -> bool {
        match self.pcr(0) {
            Some(pcr0) => pcr0.iter().all(|b| *b == 0),
            None => true,
        }
    }
}
