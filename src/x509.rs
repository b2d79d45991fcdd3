//! Self-signed X.509 v3 root CA construction.
//!
//! Each certificate sub-structure has its own builder; they all bottom out in
//! `asn1::wrap_tlv`. Only what a trust anchor needs is supported: a single
//! common-name RDN, an RSA key and the Basic Constraints + Key Usage
//! extensions.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;

use crate::asn1::{self, tag};

const OID_COMMON_NAME: &[u64] = &[2, 5, 4, 3];
const OID_RSA_ENCRYPTION: &[u64] = &[1, 2, 840, 113549, 1, 1, 1];
const OID_SHA256_WITH_RSA: &[u64] = &[1, 2, 840, 113549, 1, 1, 11];
const OID_BASIC_CONSTRAINTS: &[u64] = &[2, 5, 29, 19];
const OID_KEY_USAGE: &[u64] = &[2, 5, 29, 15];

/// keyCertSign (bit 5) | cRLSign (bit 6); the last bit of the octet is unused.
const KEY_USAGE_CERT_AND_CRL_SIGN: u8 = 0x06;

const X509_V3: u8 = 2;

pub const SERIAL_LEN: usize = 8;
pub const DEFAULT_KEY_BITS: usize = 2048;

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("RSA key generation failed: {0}")]
    KeyGeneration(#[source] rsa::Error),
    #[error("failed to export public key: {0}")]
    PublicKeyExport(#[source] rsa::pkcs1::Error),
    #[error("certificate signing failed: {0}")]
    Signing(#[source] rsa::signature::Error),
    #[error("certificate rejected as a trust anchor: {0}")]
    UntrustedEncoding(#[source] rustls::Error),
    #[error("malformed certificate: {0}")]
    Malformed(&'static str),
}

/// Validity window. Sub-second precision is dropped since DER times have none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl Validity {
    pub fn new(not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> Self {
        Self {
            not_before: not_before.trunc_subsecs(0),
            not_after: not_after.trunc_subsecs(0),
        }
    }

    pub fn starting_now(days: u32) -> Self {
        let now = Utc::now();
        Self::new(now, now + Duration::days(i64::from(days)))
    }
}

pub fn generate_key_pair(bits: usize) -> Result<RsaPrivateKey, CertificateError> {
    RsaPrivateKey::new(&mut OsRng, bits).map_err(CertificateError::KeyGeneration)
}

/// Eight random bytes, top bit cleared and next bit set so the INTEGER is
/// positive and always exactly eight bytes long.
pub fn random_serial() -> [u8; SERIAL_LEN] {
    let mut serial = [0u8; SERIAL_LEN];
    OsRng.fill_bytes(&mut serial);
    serial[0] = (serial[0] & 0x7f) | 0x40;
    serial
}

/// `SEQUENCE { SET { SEQUENCE { commonName, UTF8String } } }`
pub fn distinguished_name(common_name: &str) -> Vec<u8> {
    let attribute = asn1::sequence(&[
        &asn1::object_identifier(OID_COMMON_NAME),
        &asn1::utf8_string(common_name),
    ]);
    asn1::sequence(&[&asn1::set(&[&attribute])])
}

pub fn validity(window: &Validity) -> Vec<u8> {
    asn1::sequence(&[
        &asn1::x509_time(&window.not_before),
        &asn1::x509_time(&window.not_after),
    ])
}

fn algorithm_identifier(oid: &[u64]) -> Vec<u8> {
    asn1::sequence(&[&asn1::object_identifier(oid), &asn1::null()])
}

pub fn subject_public_key_info(public_key: &RsaPublicKey) -> Result<Vec<u8>, CertificateError> {
    let der = public_key
        .to_pkcs1_der()
        .map_err(CertificateError::PublicKeyExport)?;
    Ok(asn1::sequence(&[
        &algorithm_identifier(OID_RSA_ENCRYPTION),
        &asn1::bit_string(der.as_bytes()),
    ]))
}

fn critical_extension(oid: &[u64], value: &[u8]) -> Vec<u8> {
    asn1::sequence(&[
        &asn1::object_identifier(oid),
        &asn1::boolean(true),
        &asn1::octet_string(value),
    ])
}

/// `[3] { SEQUENCE { basicConstraints(CA), keyUsage(keyCertSign, cRLSign) } }`
pub fn ca_extensions() -> Vec<u8> {
    let basic_constraints = critical_extension(
        OID_BASIC_CONSTRAINTS,
        &asn1::sequence(&[&asn1::boolean(true)]),
    );
    let key_usage = critical_extension(
        OID_KEY_USAGE,
        &asn1::bit_string_with_unused(1, &[KEY_USAGE_CERT_AND_CRL_SIGN]),
    );
    asn1::context_explicit(3, &asn1::sequence(&[&basic_constraints, &key_usage]))
}

pub fn tbs_certificate(
    serial: &[u8],
    common_name: &str,
    window: &Validity,
    spki: &[u8],
) -> Vec<u8> {
    let name = distinguished_name(common_name);
    asn1::sequence(&[
        &asn1::context_explicit(0, &asn1::unsigned_integer(&[X509_V3])),
        &asn1::unsigned_integer(serial),
        &algorithm_identifier(OID_SHA256_WITH_RSA),
        &name,
        &validity(window),
        &name,
        spki,
        &ca_extensions(),
    ])
}

/// RSASSA-PKCS1-v1_5 with SHA-256.
pub fn sign(key: &RsaPrivateKey, message: &[u8]) -> Result<Vec<u8>, CertificateError> {
    let signing_key = SigningKey::<Sha256>::new(key.clone());
    let signature = signing_key
        .try_sign(message)
        .map_err(CertificateError::Signing)?;
    Ok(signature.to_vec())
}

pub fn build_self_signed(
    key: &RsaPrivateKey,
    common_name: &str,
    window: &Validity,
) -> Result<Vec<u8>, CertificateError> {
    build_self_signed_with_serial(key, common_name, window, &random_serial())
}

pub fn build_self_signed_with_serial(
    key: &RsaPrivateKey,
    common_name: &str,
    window: &Validity,
    serial: &[u8],
) -> Result<Vec<u8>, CertificateError> {
    let spki = subject_public_key_info(&key.to_public_key())?;
    let tbs = tbs_certificate(serial, common_name, window, &spki);
    let signature = sign(key, &tbs)?;

    Ok(asn1::sequence(&[
        &tbs,
        &algorithm_identifier(OID_SHA256_WITH_RSA),
        &asn1::bit_string(&signature),
    ]))
}

/// The three top-level elements of a certificate.
#[derive(Debug, Clone, Copy)]
pub struct CertificateParts<'a> {
    /// Full TLV of the TBSCertificate, exactly the bytes that were signed.
    pub tbs: &'a [u8],
    pub signature_algorithm: &'a [u8],
    /// Signature bytes with the BIT STRING unused-bits octet removed.
    pub signature: &'a [u8],
}

pub fn split_certificate(der: &[u8]) -> Option<CertificateParts<'_>> {
    let (outer, rest) = asn1::read_tlv(der)?;
    if outer.tag != tag::SEQUENCE || !rest.is_empty() {
        return None;
    }

    let elements = asn1::read_all(outer.content)?;
    let [tbs, algorithm, signature] = elements.as_slice() else {
        return None;
    };
    if tbs.tag != tag::SEQUENCE || algorithm.tag != tag::SEQUENCE {
        return None;
    }
    if signature.tag != tag::BIT_STRING || signature.content.first() != Some(&0) {
        return None;
    }

    Some(CertificateParts {
        tbs: tbs.raw,
        signature_algorithm: algorithm.raw,
        signature: &signature.content[1..],
    })
}

/// Extracts the RSA public key from the SubjectPublicKeyInfo in a TBSCertificate.
pub fn embedded_public_key(tbs: &[u8]) -> Option<RsaPublicKey> {
    let (outer, _) = asn1::read_tlv(tbs)?;
    let fields = asn1::read_all(outer.content)?;
    // version, serial, signature, issuer, validity, subject, spki
    let spki = fields.get(6)?;
    let spki_fields = asn1::read_all(spki.content)?;
    let key_bits = spki_fields.get(1).filter(|f| f.tag == tag::BIT_STRING)?;
    let pkcs1 = key_bits.content.get(1..)?;
    RsaPublicKey::from_pkcs1_der(pkcs1).ok()
}

/// Checks that a certificate's signature verifies with its own embedded key.
pub fn verify_self_signed(der: &[u8]) -> Result<(), CertificateError> {
    let parts = split_certificate(der).ok_or(CertificateError::Malformed("not a certificate"))?;
    if parts.signature_algorithm != algorithm_identifier(OID_SHA256_WITH_RSA).as_slice() {
        return Err(CertificateError::Malformed("unsupported signature algorithm"));
    }

    let public_key =
        embedded_public_key(parts.tbs).ok_or(CertificateError::Malformed("no RSA public key"))?;
    let signature =
        Signature::try_from(parts.signature).map_err(CertificateError::Signing)?;

    VerifyingKey::<Sha256>::new(public_key)
        .verify(parts.tbs, &signature)
        .map_err(CertificateError::Signing)
}
