use std::fs;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use lopdf::{Dictionary, Document, Object};
use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{Id, PKey, Private};
use openssl::sign::Signer;
use openssl::x509::X509;
use sha2::{Digest, Sha256, Sha384, Sha512};
use tracing::error;

use crate::error::{ContractError, Result};

// Reserved space for the DER-encoded CMS blob inside /Contents. A 2048-bit
// RSA signature with a small chain needs a few KB; the rest pads with zeros.
const SIGNATURE_CAPACITY: usize = 8192;

// ByteRange sentinels, each exactly 10 digits so the in-place patch keeps
// every offset stable.
const BR_SENTINEL: &str = "[0 1111111111 2222222222 3333333333]";

const OID_SHA256: &[u8] = &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01];
const OID_SHA384: &[u8] = &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x02];
const OID_SHA512: &[u8] = &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x03];
const OID_RSA_ENCRYPTION: &[u8] = &[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x01];
const OID_ECDSA_SHA256: &[u8] = &[0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x04, 0x03, 0x02];
const OID_ECDSA_SHA384: &[u8] = &[0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x04, 0x03, 0x03];
const OID_ECDSA_SHA512: &[u8] = &[0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x04, 0x03, 0x04];
const OID_DATA: &[u8] = &[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x07, 0x01];
const OID_SIGNED_DATA: &[u8] = &[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x07, 0x02];
const OID_CONTENT_TYPE: &[u8] = &[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x09, 0x03];
const OID_MESSAGE_DIGEST: &[u8] = &[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x09, 0x04];
const OID_SIGNING_TIME: &[u8] = &[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x09, 0x05];
const OID_SIGNING_CERTIFICATE_V2: &[u8] = &[
    0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x09, 0x10, 0x02, 0x2F,
];

/// Digest negotiated from configuration. An unrecognized name is an explicit
/// failure; the signer never substitutes a different algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "sha384" => Ok(DigestAlgorithm::Sha384),
            "sha512" => Ok(DigestAlgorithm::Sha512),
            other => Err(ContractError::SigningOperationFailed(format!(
                "unsupported digest algorithm '{other}'"
            ))),
        }
    }

    fn oid(&self) -> &'static [u8] {
        match self {
            DigestAlgorithm::Sha256 => OID_SHA256,
            DigestAlgorithm::Sha384 => OID_SHA384,
            DigestAlgorithm::Sha512 => OID_SHA512,
        }
    }

    fn message_digest(&self) -> MessageDigest {
        match self {
            DigestAlgorithm::Sha256 => MessageDigest::sha256(),
            DigestAlgorithm::Sha384 => MessageDigest::sha384(),
            DigestAlgorithm::Sha512 => MessageDigest::sha512(),
        }
    }

    fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            DigestAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            DigestAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
            DigestAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

/// Key and certificate chain from a password-protected PKCS#12 container.
/// Loaded fresh per signing operation and dropped with it; never cached.
pub struct CertificateBundle {
    pkey: PKey<Private>,
    cert: X509,
    chain: Vec<X509>,
}

impl CertificateBundle {
    pub fn load(path: &Path, password: &str) -> Result<Self> {
        let der = fs::read(path)
            .map_err(|_| ContractError::CertificateNotFound(path.display().to_string()))?;
        let container = Pkcs12::from_der(&der).map_err(|e| {
            error!(error = %e, "PKCS#12 container is not parseable");
            ContractError::SigningOperationFailed(format!("invalid PKCS#12 container: {e}"))
        })?;
        // A wrong password fails the container MAC check.
        let parsed = container
            .parse2(password)
            .map_err(|_| ContractError::CertificatePasswordInvalid)?;

        let pkey = parsed.pkey.ok_or_else(|| {
            ContractError::SigningOperationFailed("container holds no private key".into())
        })?;
        let cert = parsed.cert.ok_or_else(|| {
            ContractError::SigningOperationFailed("container holds no certificate".into())
        })?;
        let chain = parsed
            .ca
            .map(|stack| stack.into_iter().collect())
            .unwrap_or_default();

        let now = Asn1Time::days_from_now(0).map_err(|e| {
            ContractError::SigningOperationFailed(format!("clock unavailable: {e}"))
        })?;
        let expired = cert
            .not_after()
            .compare(&now)
            .map_err(|e| ContractError::SigningOperationFailed(format!("notAfter: {e}")))?
            == std::cmp::Ordering::Less;
        if expired {
            return Err(ContractError::CertificateExpired);
        }

        Ok(CertificateBundle { pkey, cert, chain })
    }

    pub fn signer_common_name(&self) -> String {
        self.cert
            .subject_name()
            .entries_by_nid(openssl::nid::Nid::COMMONNAME)
            .next()
            .map(|e| String::from_utf8_lossy(e.data().as_slice()).into_owned())
            .unwrap_or_else(|| "unknown signer".to_string())
    }
}

/// Embeds a PAdES-BES style incorporated signature: a signature field whose
/// `/Contents` carries a CMS SignedData blob over the document's byte range,
/// with the certificate chain and signing time inside the signed attributes.
/// Nothing may modify the document after this step; any later edit falls
/// outside the byte range and breaks verification, by construction.
pub fn sign_document(
    pdf: &[u8],
    bundle: &CertificateBundle,
    digest: DigestAlgorithm,
    signing_time: DateTime<Utc>,
) -> Result<Vec<u8>> {
    let mut doc = Document::load_mem(pdf)
        .map_err(|e| ContractError::SigningOperationFailed(format!("document load: {e}")))?;

    let sig_id = add_signature_dictionary(&mut doc, bundle, signing_time)?;
    add_signature_field(&mut doc, sig_id)?;

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes)
        .map_err(|e| ContractError::SigningOperationFailed(format!("save: {e}")))?;

    // Locate the zero-filled hex placeholder and patch the byte range around
    // the gap, keeping every offset stable (equal-width replacement).
    let placeholder: Vec<u8> = {
        let mut p = vec![b'<'];
        p.extend(std::iter::repeat(b'0').take(SIGNATURE_CAPACITY * 2));
        p.push(b'>');
        p
    };
    let contents_start = find_subslice(&bytes, &placeholder).ok_or_else(|| {
        ContractError::SigningOperationFailed("signature placeholder not found".into())
    })?;
    let contents_end = contents_start + placeholder.len();
    let total = bytes.len();

    let br_offset = find_subslice(&bytes, BR_SENTINEL.as_bytes()).ok_or_else(|| {
        ContractError::SigningOperationFailed("byte range sentinel not found".into())
    })?;
    let byte_range = [0i64, contents_start as i64, contents_end as i64, (total - contents_end) as i64];
    let patched_range = format!(
        "[0 {:<10} {:<10} {:<10}]",
        byte_range[1], byte_range[2], byte_range[3]
    );
    debug_assert_eq!(patched_range.len(), BR_SENTINEL.len());
    bytes[br_offset..br_offset + BR_SENTINEL.len()].copy_from_slice(patched_range.as_bytes());

    // Digest of everything outside the /Contents gap.
    let mut covered = Vec::with_capacity(total - placeholder.len());
    covered.extend_from_slice(&bytes[..contents_start]);
    covered.extend_from_slice(&bytes[contents_end..]);
    let document_hash = digest.digest(&covered);

    let cms = build_signed_data(&document_hash, bundle, digest, signing_time)?;
    if cms.len() > SIGNATURE_CAPACITY {
        return Err(ContractError::SigningOperationFailed(format!(
            "signature blob of {} bytes exceeds the reserved {} bytes",
            cms.len(),
            SIGNATURE_CAPACITY
        )));
    }
    let hex_sig = hex::encode(&cms);
    let region = &mut bytes[contents_start + 1..contents_start + 1 + hex_sig.len()];
    region.copy_from_slice(hex_sig.as_bytes());

    Ok(bytes)
}

fn add_signature_dictionary(
    doc: &mut Document,
    bundle: &CertificateBundle,
    signing_time: DateTime<Utc>,
) -> Result<lopdf::ObjectId> {
    let mut sig = Dictionary::new();
    sig.set(b"Type", Object::Name(b"Sig".to_vec()));
    sig.set(b"Filter", Object::Name(b"Adobe.PPKLite".to_vec()));
    sig.set(b"SubFilter", Object::Name(b"ETSI.CAdES.detached".to_vec()));
    sig.set(
        b"Contents",
        Object::String(vec![0u8; SIGNATURE_CAPACITY], lopdf::StringFormat::Hexadecimal),
    );
    sig.set(
        b"ByteRange",
        Object::Array(vec![
            Object::Integer(0),
            Object::Integer(1111111111),
            Object::Integer(2222222222),
            Object::Integer(3333333333),
        ]),
    );
    sig.set(
        b"M",
        Object::String(
            format!("D:{}+00'00'", signing_time.format("%Y%m%d%H%M%S")).into_bytes(),
            lopdf::StringFormat::Literal,
        ),
    );
    sig.set(
        b"Name",
        Object::String(
            bundle.signer_common_name().into_bytes(),
            lopdf::StringFormat::Literal,
        ),
    );
    Ok(doc.add_object(Object::Dictionary(sig)))
}

/// Invisible signature widget on the last page, registered in the AcroForm.
fn add_signature_field(doc: &mut Document, sig_id: lopdf::ObjectId) -> Result<()> {
    let pages = doc.get_pages();
    let last_page_id = pages
        .values()
        .last()
        .copied()
        .ok_or_else(|| ContractError::SigningOperationFailed("document has no pages".into()))?;

    let mut field = Dictionary::new();
    field.set(b"Type", Object::Name(b"Annot".to_vec()));
    field.set(b"Subtype", Object::Name(b"Widget".to_vec()));
    field.set(b"FT", Object::Name(b"Sig".to_vec()));
    field.set(
        b"T",
        Object::String(b"Signature1".to_vec(), lopdf::StringFormat::Literal),
    );
    field.set(b"V", Object::Reference(sig_id));
    field.set(
        b"Rect",
        Object::Array(vec![
            Object::Integer(0),
            Object::Integer(0),
            Object::Integer(0),
            Object::Integer(0),
        ]),
    );
    field.set(b"F", Object::Integer(132));
    field.set(b"P", Object::Reference(last_page_id));
    let field_id = doc.add_object(Object::Dictionary(field));

    let page_dict = doc
        .get_object_mut(last_page_id)
        .and_then(Object::as_dict_mut)
        .map_err(|e| ContractError::SigningOperationFailed(format!("page object: {e}")))?;
    let annots = match page_dict.get(b"Annots") {
        Ok(Object::Array(existing)) => {
            let mut arr = existing.clone();
            arr.push(Object::Reference(field_id));
            arr
        }
        _ => vec![Object::Reference(field_id)],
    };
    page_dict.set(b"Annots", Object::Array(annots));

    let mut acroform = Dictionary::new();
    acroform.set(b"Fields", Object::Array(vec![Object::Reference(field_id)]));
    acroform.set(b"SigFlags", Object::Integer(3));
    let acroform_id = doc.add_object(Object::Dictionary(acroform));

    let catalog_id = doc
        .trailer
        .get(b"Root")
        .and_then(Object::as_reference)
        .map_err(|e| ContractError::SigningOperationFailed(format!("catalog: {e}")))?;
    let catalog = doc
        .get_object_mut(catalog_id)
        .and_then(Object::as_dict_mut)
        .map_err(|e| ContractError::SigningOperationFailed(format!("catalog: {e}")))?;
    catalog.set(b"AcroForm", Object::Reference(acroform_id));
    Ok(())
}

// --- CMS SignedData (PAdES-BES profile) ---

fn build_signed_data(
    document_hash: &[u8],
    bundle: &CertificateBundle,
    digest: DigestAlgorithm,
    signing_time: DateTime<Utc>,
) -> Result<Vec<u8>> {
    let signing_cert_der = bundle
        .cert
        .to_der()
        .map_err(|e| ContractError::SigningOperationFailed(format!("certificate DER: {e}")))?;

    // Signed attributes: content-type, signing-time, message-digest,
    // signing-certificate-v2. The attribute content is tagged SET when it is
    // what gets signed, and [0] IMPLICIT when embedded in the SignerInfo.
    let mut attrs = Vec::new();
    attrs.extend(der_attribute(OID_CONTENT_TYPE, &der_oid(OID_DATA)));
    attrs.extend(der_attribute(
        OID_SIGNING_TIME,
        &der_utc_time(&signing_time),
    ));
    attrs.extend(der_attribute(
        OID_MESSAGE_DIGEST,
        &der_octet_string(document_hash),
    ));
    attrs.extend(signing_certificate_v2(&signing_cert_der));

    let attrs_as_set = der_tlv(0x31, &attrs);
    let attrs_embedded = der_tlv(0xA0, &attrs);

    let mut signer = Signer::new(digest.message_digest(), &bundle.pkey)
        .map_err(|e| ContractError::SigningOperationFailed(format!("signer init: {e}")))?;
    signer
        .update(&attrs_as_set)
        .map_err(|e| ContractError::SigningOperationFailed(format!("sign update: {e}")))?;
    let signature = signer
        .sign_to_vec()
        .map_err(|e| ContractError::SigningOperationFailed(format!("sign: {e}")))?;

    // RFC 5758: ecdsa-with-SHA2 carries no parameters field; rsaEncryption
    // keeps its explicit NULL.
    let signature_algorithm = match (bundle.pkey.id(), digest) {
        (Id::RSA, _) => der_algorithm_identifier(OID_RSA_ENCRYPTION),
        (Id::EC, DigestAlgorithm::Sha256) => der_algorithm_identifier_absent_params(OID_ECDSA_SHA256),
        (Id::EC, DigestAlgorithm::Sha384) => der_algorithm_identifier_absent_params(OID_ECDSA_SHA384),
        (Id::EC, DigestAlgorithm::Sha512) => der_algorithm_identifier_absent_params(OID_ECDSA_SHA512),
        (other, _) => {
            return Err(ContractError::SigningOperationFailed(format!(
                "unsupported key type {other:?}"
            )))
        }
    };

    let issuer_der = bundle
        .cert
        .issuer_name()
        .to_der()
        .map_err(|e| ContractError::SigningOperationFailed(format!("issuer DER: {e}")))?;
    let serial = bundle
        .cert
        .serial_number()
        .to_bn()
        .and_then(|bn| bn.to_vec_padded(bn.num_bytes()))
        .map_err(|e| ContractError::SigningOperationFailed(format!("serial: {e}")))?;

    // SignerInfo
    let mut signer_info = Vec::new();
    signer_info.extend(der_integer(&[1]));
    signer_info.extend(der_sequence(&[&issuer_der, &der_integer(&serial)]));
    signer_info.extend(der_algorithm_identifier(digest.oid()));
    signer_info.extend(attrs_embedded);
    signer_info.extend(signature_algorithm);
    signer_info.extend(der_octet_string(&signature));
    let signer_info = der_sequence(&[&signer_info]);

    // Certificates: signer first, then the rest of the chain.
    let mut certs_der = signing_cert_der.clone();
    for ca in &bundle.chain {
        certs_der.extend(ca.to_der().map_err(|e| {
            ContractError::SigningOperationFailed(format!("chain certificate DER: {e}"))
        })?);
    }

    // SignedData
    let mut signed_data = Vec::new();
    signed_data.extend(der_integer(&[1]));
    signed_data.extend(der_tlv(0x31, &der_algorithm_identifier(digest.oid())));
    signed_data.extend(der_sequence(&[&der_oid(OID_DATA)]));
    signed_data.extend(der_tlv(0xA0, &certs_der));
    signed_data.extend(der_tlv(0x31, &signer_info));
    let signed_data = der_sequence(&[&signed_data]);

    // ContentInfo
    Ok(der_sequence(&[
        &der_oid(OID_SIGNED_DATA),
        &der_tlv(0xA0, &signed_data),
    ]))
}

/// ESS signing-certificate-v2 attribute (SHA-256 hash of the signing
/// certificate), required by the BES profile.
fn signing_certificate_v2(certificate_der: &[u8]) -> Vec<u8> {
    let cert_hash = Sha256::digest(certificate_der);
    let ess_cert_id = der_sequence(&[
        &der_algorithm_identifier(OID_SHA256),
        &der_octet_string(&cert_hash),
    ]);
    let certs = der_sequence(&[&ess_cert_id]);
    let signing_cert = der_sequence(&[&certs]);
    der_attribute(OID_SIGNING_CERTIFICATE_V2, &signing_cert)
}

// --- ASN.1 DER helpers ---

fn der_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    if len < 128 {
        out.push(len as u8);
    } else if len < 256 {
        out.push(0x81);
        out.push(len as u8);
    } else if len < 65536 {
        out.push(0x82);
        out.push((len >> 8) as u8);
        out.push(len as u8);
    } else {
        out.push(0x83);
        out.push((len >> 16) as u8);
        out.push((len >> 8) as u8);
        out.push(len as u8);
    }
    out.extend_from_slice(content);
    out
}

fn der_sequence(items: &[&[u8]]) -> Vec<u8> {
    let content: Vec<u8> = items.iter().flat_map(|i| i.iter().copied()).collect();
    der_tlv(0x30, &content)
}

fn der_oid(oid: &[u8]) -> Vec<u8> {
    der_tlv(0x06, oid)
}

fn der_integer(value: &[u8]) -> Vec<u8> {
    let trimmed: &[u8] = {
        let mut v = value;
        while v.len() > 1 && v[0] == 0 && v[1] & 0x80 == 0 {
            v = &v[1..];
        }
        v
    };
    if trimmed.is_empty() {
        return der_tlv(0x02, &[0]);
    }
    if trimmed[0] & 0x80 != 0 {
        let mut padded = vec![0];
        padded.extend_from_slice(trimmed);
        der_tlv(0x02, &padded)
    } else {
        der_tlv(0x02, trimmed)
    }
}

fn der_octet_string(content: &[u8]) -> Vec<u8> {
    der_tlv(0x04, content)
}

fn der_utc_time(ts: &DateTime<Utc>) -> Vec<u8> {
    der_tlv(0x17, ts.format("%y%m%d%H%M%SZ").to_string().as_bytes())
}

fn der_algorithm_identifier(oid: &[u8]) -> Vec<u8> {
    der_sequence(&[&der_oid(oid), &[0x05, 0x00]])
}

fn der_algorithm_identifier_absent_params(oid: &[u8]) -> Vec<u8> {
    der_sequence(&[&der_oid(oid)])
}

/// Attribute ::= SEQUENCE { type OID, values SET }
fn der_attribute(oid: &[u8], value: &[u8]) -> Vec<u8> {
    der_sequence(&[&der_oid(oid), &der_tlv(0x31, value)])
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

// --- verification ---

/// Outcome of checking an incorporated signature against its own embedded
/// certificate chain.
#[derive(Debug)]
pub struct VerifiedSignature {
    pub signer: String,
    pub signing_time: DateTime<Utc>,
}

/// Verifies the embedded signature from the document alone: extracts the
/// byte range and CMS blob, checks the signature (and the message-digest
/// attribute) against the embedded certificates, and reports the attested
/// signing time.
pub fn verify_signature(pdf: &[u8]) -> Result<VerifiedSignature> {
    let marker = b"/ByteRange";
    let br_offset = find_subslice(pdf, marker)
        .ok_or_else(|| ContractError::SigningOperationFailed("no byte range found".into()))?;
    let range_area = &pdf[br_offset..std::cmp::min(br_offset + 128, pdf.len())];
    let open = find_subslice(range_area, b"[")
        .ok_or_else(|| ContractError::SigningOperationFailed("malformed byte range".into()))?;
    let close = find_subslice(range_area, b"]")
        .ok_or_else(|| ContractError::SigningOperationFailed("malformed byte range".into()))?;
    let numbers: Vec<usize> = String::from_utf8_lossy(&range_area[open + 1..close])
        .split_whitespace()
        .filter_map(|n| n.parse().ok())
        .collect();
    if numbers.len() != 4 {
        return Err(ContractError::SigningOperationFailed(
            "byte range does not hold four offsets".into(),
        ));
    }

    let gap_start = numbers[1];
    let gap_end = numbers[2];
    if gap_end > pdf.len() || numbers[2] + numbers[3] != pdf.len() {
        return Err(ContractError::SigningOperationFailed(
            "byte range inconsistent with document length".into(),
        ));
    }

    // Hex blob sits between '<' and '>' inside the gap; zero padding after
    // the DER content is ignored by length-directed parsing.
    let hex_region = &pdf[gap_start + 1..gap_end - 1];
    let cms = hex::decode(hex_region)
        .map_err(|e| ContractError::SigningOperationFailed(format!("signature hex: {e}")))?;

    let mut covered = Vec::with_capacity(pdf.len());
    covered.extend_from_slice(&pdf[..gap_start]);
    covered.extend_from_slice(&pdf[gap_end..]);

    let pkcs7 = openssl::pkcs7::Pkcs7::from_der(&cms)
        .map_err(|e| ContractError::SigningOperationFailed(format!("CMS parse: {e}")))?;
    let certs = openssl::stack::Stack::new()
        .map_err(|e| ContractError::SigningOperationFailed(format!("stack: {e}")))?;
    let store = openssl::x509::store::X509StoreBuilder::new()
        .map_err(|e| ContractError::SigningOperationFailed(format!("store: {e}")))?
        .build();
    pkcs7
        .verify(
            &certs,
            &store,
            Some(&covered),
            None,
            openssl::pkcs7::Pkcs7Flags::NOVERIFY,
        )
        .map_err(|e| ContractError::SigningOperationFailed(format!("signature invalid: {e}")))?;

    let signing_time = extract_signing_time(&cms)?;
    let signer = pkcs7
        .signed()
        .and_then(|signed| signed.certificates())
        .and_then(|stack| stack.iter().next())
        .and_then(|cert| {
            cert.subject_name()
                .entries_by_nid(openssl::nid::Nid::COMMONNAME)
                .next()
                .map(|e| String::from_utf8_lossy(e.data().as_slice()).into_owned())
        })
        .unwrap_or_else(|| "unknown signer".to_string());

    Ok(VerifiedSignature {
        signer,
        signing_time,
    })
}

/// Scans the CMS DER for the signing-time attribute and parses its UTCTime.
fn extract_signing_time(cms: &[u8]) -> Result<DateTime<Utc>> {
    let oid = der_oid(OID_SIGNING_TIME);
    let pos = find_subslice(cms, &oid).ok_or_else(|| {
        ContractError::SigningOperationFailed("no signing-time attribute".into())
    })?;
    let rest = &cms[pos + oid.len()..];
    let utc_pos = rest
        .iter()
        .position(|&b| b == 0x17)
        .ok_or_else(|| ContractError::SigningOperationFailed("no UTCTime after signing-time".into()))?;
    let len = *rest.get(utc_pos + 1).ok_or_else(|| {
        ContractError::SigningOperationFailed("truncated signing-time".into())
    })? as usize;
    let raw = rest
        .get(utc_pos + 2..utc_pos + 2 + len)
        .ok_or_else(|| ContractError::SigningOperationFailed("truncated signing-time".into()))?;
    let text = std::str::from_utf8(raw)
        .map_err(|_| ContractError::SigningOperationFailed("signing-time not ASCII".into()))?;
    let naive = chrono::NaiveDateTime::parse_from_str(text, "%y%m%d%H%M%SZ")
        .map_err(|e| ContractError::SigningOperationFailed(format!("signing-time parse: {e}")))?;
    Ok(Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{default_commission_table, render_contract, SubjectData};
    use chrono::NaiveDate;
    use openssl::asn1::Asn1Time;
    use openssl::bn::{BigNum, MsbOption};
    use openssl::hash::MessageDigest;
    use openssl::rsa::Rsa;
    use openssl::x509::{X509NameBuilder, X509};
    use std::io::Write;

    fn base_pdf() -> Vec<u8> {
        let subject = SubjectData {
            name: "Ana Gómez".to_string(),
            identity_document: None,
            address: None,
            email: None,
        };
        render_contract(
            &subject,
            &default_commission_table(),
            NaiveDate::from_ymd_opt(2026, 3, 14).unwrap(),
        )
        .unwrap()
    }

    fn self_signed(not_after_days_from_now: i64) -> (PKey<Private>, X509) {
        let rsa = Rsa::generate(2048).unwrap();
        let pkey = PKey::from_rsa(rsa).unwrap();
        let cert = cert_for(&pkey, not_after_days_from_now);
        (pkey, cert)
    }

    fn cert_for(pkey: &PKey<Private>, not_after_days_from_now: i64) -> X509 {
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "Presidente SIGP").unwrap();
        let name = name.build();

        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        let mut serial_bn = BigNum::new().unwrap();
        serial_bn.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();
        let serial = serial_bn.to_asn1_integer().unwrap();
        builder.set_serial_number(&serial).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(pkey).unwrap();
        let not_before = Asn1Time::from_unix(chrono::Utc::now().timestamp() - 86_400).unwrap();
        let not_after = Asn1Time::from_unix(
            chrono::Utc::now().timestamp() + not_after_days_from_now * 86_400,
        )
        .unwrap();
        builder.set_not_before(&not_before).unwrap();
        builder.set_not_after(&not_after).unwrap();
        builder.sign(pkey, MessageDigest::sha256()).unwrap();
        builder.build()
    }

    pub(crate) fn write_test_p12(
        dir: &std::path::Path,
        password: &str,
        not_after_days: i64,
    ) -> std::path::PathBuf {
        let (pkey, cert) = self_signed(not_after_days);
        let p12 = Pkcs12::builder()
            .name("officer")
            .pkey(&pkey)
            .cert(&cert)
            .build2(password)
            .unwrap();
        let path = dir.join("officer.p12");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&p12.to_der().unwrap()).unwrap();
        path
    }

    #[test]
    fn load_rejects_missing_file() {
        let err = CertificateBundle::load(std::path::Path::new("/nonexistent/officer.p12"), "x")
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, ContractError::CertificateNotFound(_)));
    }

    #[test]
    fn load_rejects_wrong_password() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_p12(dir.path(), "secret", 365);
        let err = CertificateBundle::load(&path, "not-the-password")
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, ContractError::CertificatePasswordInvalid));
    }

    #[test]
    fn load_rejects_expired_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_p12(dir.path(), "secret", -10);
        let err = CertificateBundle::load(&path, "secret")
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, ContractError::CertificateExpired));
    }

    #[test]
    fn unknown_digest_is_an_explicit_failure() {
        let err = DigestAlgorithm::from_name("md5").unwrap_err();
        assert!(matches!(err, ContractError::SigningOperationFailed(_)));
    }

    #[test]
    fn sign_then_verify_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_p12(dir.path(), "secret", 365);
        let bundle = CertificateBundle::load(&path, "secret").unwrap();

        let before = Utc::now();
        let signed = sign_document(&base_pdf(), &bundle, DigestAlgorithm::Sha256, before).unwrap();
        let verified = verify_signature(&signed).unwrap();
        assert_eq!(verified.signer, "Presidente SIGP");
        let drift = (verified.signing_time - before).num_seconds().abs();
        assert!(drift <= 1, "signing time drifted {drift}s");
    }

    #[test]
    fn tampering_after_signing_breaks_verification() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_p12(dir.path(), "secret", 365);
        let bundle = CertificateBundle::load(&path, "secret").unwrap();
        let mut signed =
            sign_document(&base_pdf(), &bundle, DigestAlgorithm::Sha256, Utc::now()).unwrap();
        // Flip one byte in the covered region.
        signed[10] ^= 0xFF;
        assert!(verify_signature(&signed).is_err());
    }

    #[test]
    fn ec_signed_document_verifies() {
        let group =
            openssl::ec::EcGroup::from_curve_name(openssl::nid::Nid::X9_62_PRIME256V1).unwrap();
        let pkey = PKey::from_ec_key(openssl::ec::EcKey::generate(&group).unwrap()).unwrap();
        let cert = cert_for(&pkey, 365);
        let bundle = CertificateBundle {
            pkey,
            cert,
            chain: Vec::new(),
        };
        let signed =
            sign_document(&base_pdf(), &bundle, DigestAlgorithm::Sha256, Utc::now()).unwrap();
        let verified = verify_signature(&signed).unwrap();
        assert_eq!(verified.signer, "Presidente SIGP");
    }

    #[test]
    fn ecdsa_algorithm_identifier_carries_no_parameters() {
        let alg = der_algorithm_identifier_absent_params(OID_ECDSA_SHA256);
        assert_eq!(alg.len(), 2 + der_oid(OID_ECDSA_SHA256).len());
        assert!(!alg.ends_with(&[0x05, 0x00]));
    }

    #[test]
    fn der_integer_pads_high_bit() {
        assert_eq!(der_integer(&[0x01]), vec![0x02, 0x01, 0x01]);
        assert_eq!(der_integer(&[0x80]), vec![0x02, 0x02, 0x00, 0x80]);
        assert_eq!(der_integer(&[0x00, 0x7F]), vec![0x02, 0x01, 0x7F]);
    }

    #[test]
    fn der_tlv_long_form_lengths() {
        let content = vec![0u8; 300];
        let tlv = der_tlv(0x04, &content);
        assert_eq!(&tlv[..4], &[0x04, 0x82, 0x01, 0x2C]);
        assert_eq!(tlv.len(), 4 + 300);
    }
}
