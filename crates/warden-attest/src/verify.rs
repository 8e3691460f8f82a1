//! The build and instance trust chain.
//!
//! PCR8 alone does not prove authorship: it is a static value anyone
//! can observe once an instance is public, then commit to and relaunch
//! as "their" build. The chain therefore requires the actual signing
//! certificate, checks it points at the builder pubkey, and recomputes
//! PCR8 from the certificate bytes.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use sha2::{Digest, Sha384};
use tracing::debug;
use x509_parser::prelude::{FromDer, X509Certificate, X509Name};

use warden_core::Event;

use crate::doc::AttestationDoc;
use crate::error::{AttestError, AttestResult};

/// One PCR extend step from the zero state: `Sha384(zeros ‖ data)`.
pub fn pcr_extend_digest(data: &[u8]) -> String {
    let mut hasher = Sha384::new();
    hasher.update([0u8; 48]);
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn name_attr<'a>(
    mut attrs: impl Iterator<Item = &'a x509_parser::x509::AttributeTypeAndValue<'a>>,
) -> Option<&'a str> {
    attrs.next().and_then(|a| a.as_str().ok())
}

/// The certificate must be self-issued, self-signed, currently valid,
/// issued to `O=Nostr` with `OU=` the builder pubkey, and reproduce
/// the enclave's PCR8 when extended from zero.
pub fn validate_build_cert(
    cert_der: &[u8],
    build_pubkey: &str,
    pcr8_hex: &str,
) -> AttestResult<()> {
    let (rest, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| AttestError::CertInvalid(e.to_string()))?;
    if !rest.is_empty() {
        return Err(AttestError::CertInvalid("trailing bytes".into()));
    }

    let issuer: &X509Name = cert.issuer();
    if issuer.as_raw() != cert.subject().as_raw() {
        return Err(AttestError::CertInvalid("not self-issued".into()));
    }
    if !cert.validity().is_valid() {
        return Err(AttestError::CertInvalid("outside validity window".into()));
    }
    cert.verify_signature(None)
        .map_err(|_| AttestError::CertInvalid("signature does not verify".into()))?;

    if name_attr(issuer.iter_organization()) != Some("Nostr") {
        return Err(AttestError::CertInvalid("issuer O is not Nostr".into()));
    }
    if name_attr(issuer.iter_organizational_unit()) != Some(build_pubkey) {
        return Err(AttestError::CertInvalid("issuer OU is not the builder".into()));
    }

    let fingerprint = Sha384::digest(cert_der);
    let cert_pcr8 = pcr_extend_digest(&fingerprint);
    debug!(cert_pcr8 = %cert_pcr8, "certificate fingerprint chain");
    if cert_pcr8 != pcr8_hex {
        return Err(AttestError::CertInvalid("does not reproduce PCR8".into()));
    }
    Ok(())
}

/// Check a build record against the enclave's own measurements.
pub fn verify_build(doc: &AttestationDoc, build: &Event) -> AttestResult<()> {
    let enclave_pcr8 = doc.pcr_hex(8)?;
    let build_pcr8 = build
        .tag_value("PCR8")
        .ok_or_else(|| AttestError::BuildMismatch("no PCR8 tag".into()))?;
    if enclave_pcr8 != build_pcr8 {
        return Err(AttestError::BuildMismatch("PCR8 differs".into()));
    }
    let cert_b64 = build
        .tag_value("cert")
        .ok_or_else(|| AttestError::BuildMismatch("no cert tag".into()))?;
    let cert_der = B64
        .decode(cert_b64.replace(['\n', '\r'], ""))
        .map_err(|e| AttestError::CertInvalid(e.to_string()))?;
    validate_build_cert(&cert_der, &build.pubkey, &enclave_pcr8)
}

/// Check an instance record: its PCR4 must match the parent instance
/// id measured into our own attestation.
pub fn verify_instance(doc: &AttestationDoc, instance: &Event) -> AttestResult<()> {
    let enclave_pcr4 = doc.pcr_hex(4)?;
    let instance_pcr4 = instance
        .tag_value("PCR4")
        .ok_or_else(|| AttestError::InstanceMismatch("no PCR4 tag".into()))?;
    if enclave_pcr4 != instance_pcr4 {
        return Err(AttestError::InstanceMismatch("PCR4 differs".into()));
    }
    Ok(())
}

/// Production deployments only accept records tagged `t=prod`.
pub fn require_prod(event: &Event, what: &'static str) -> AttestResult<()> {
    if event.has_tag("t", "prod") {
        Ok(())
    } else {
        Err(AttestError::NotProduction(what))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extend_digest_is_zero_seeded() {
        let digest = pcr_extend_digest(b"data");
        let mut hasher = Sha384::new();
        hasher.update([0u8; 48]);
        hasher.update(b"data");
        assert_eq!(digest, hex::encode(hasher.finalize()));
        assert_eq!(digest.len(), 96);
        assert_ne!(digest, pcr_extend_digest(b"other"));
    }

    #[test]
    fn test_garbage_cert_rejected() {
        assert!(matches!(
            validate_build_cert(b"not der", "pk", "00"),
            Err(AttestError::CertInvalid(_))
        ));
    }
}
