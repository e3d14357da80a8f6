//! End-to-end pipeline scenarios: generate, partner stamp, officer stamp with
//! the final incorporated digital signature, plus the failure paths that must
//! leave contract state untouched.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use image::{Rgba, RgbaImage};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::{X509NameBuilder, X509};

use sigp_contracts::audit::AuditEventType;
use sigp_contracts::contract::ContractState;
use sigp_contracts::signer::verify_signature;
use sigp_contracts::stamp::PageMode;
use sigp_contracts::token::{SigningRole, TokenIssuer};
use sigp_contracts::{ContractError, ContractService, Settings, SubjectData};

const CERT_PASSWORD: &str = "officer-secret";
const TOKEN_SECRET: &str = "pipeline-test-secret";

fn write_p12(dir: &Path) -> PathBuf {
    let rsa = Rsa::generate(2048).unwrap();
    let pkey = PKey::from_rsa(rsa).unwrap();
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", "Presidente SIGP").unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&pkey).unwrap();
    builder
        .set_not_before(&Asn1Time::from_unix(Utc::now().timestamp() - 86_400).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::from_unix(Utc::now().timestamp() + 365 * 86_400).unwrap())
        .unwrap();
    builder.sign(&pkey, MessageDigest::sha256()).unwrap();
    let cert = builder.build();

    let p12 = Pkcs12::builder()
        .name("officer")
        .pkey(&pkey)
        .cert(&cert)
        .build2(CERT_PASSWORD)
        .unwrap();
    let path = dir.join("officer.p12");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(&p12.to_der().unwrap()).unwrap();
    path
}

fn settings(dir: &Path, cert_password: &str) -> Settings {
    Settings {
        certificate_path: dir.join("officer.p12"),
        certificate_password: cert_password.to_string(),
        token_secret: TOKEN_SECRET.to_string(),
        token_ttl_minutes: 60,
        officer_name: "Presidente SIGP".to_string(),
        public_base_url: "https://sigp.example.com".to_string(),
        data_dir: dir.join("data"),
        page_mode: PageMode::Clamp,
        digest_algorithm: "sha256".to_string(),
    }
}

fn signature_png(seed: u8) -> Vec<u8> {
    let mut img = RgbaImage::from_pixel(160, 50, Rgba([0, 0, 0, 0]));
    for x in 10..150 {
        img.put_pixel(x, (20 + (x + seed as u32) % 10) as u32, Rgba([10, 10, 90, 255]));
    }
    let mut out = std::io::Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageOutputFormat::Png).unwrap();
    out.into_inner()
}

fn token_from(link: &str) -> &str {
    link.split("token=").nth(1).unwrap()
}

#[test]
fn full_signing_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    write_p12(dir.path());
    let service = ContractService::new(settings(dir.path(), CERT_PASSWORD)).unwrap();

    let subject = SubjectData {
        name: "Ana Gómez".to_string(),
        identity_document: None,
        address: None,
        email: None,
    };

    let generated = service.generate(subject).unwrap();
    assert_eq!(generated.state, ContractState::Generated);
    let h0 = generated.content_hash.clone();

    let partner_link = generated.signing_link.clone().unwrap();
    let partner = service
        .submit_partner_signature(token_from(&partner_link), &signature_png(1))
        .unwrap();
    assert_eq!(partner.state, ContractState::PartnerSigned);
    let h1 = partner.content_hash.clone();
    assert_ne!(h1, h0);

    let officer_link = partner.signing_link.clone().unwrap();
    let before_signing = Utc::now();
    let completed = service
        .submit_officer_signature(token_from(&officer_link), &signature_png(2))
        .unwrap();
    assert_eq!(completed.state, ContractState::OfficerSigned);
    let h2 = completed.content_hash.clone();
    assert_ne!(h2, h1);
    assert!(completed.signing_link.is_none());

    // The terminal artifact carries a verifiable incorporated signature.
    let record = service.contract(completed.contract_id).unwrap();
    let signed_bytes = std::fs::read(&record.document_path).unwrap();
    let verified = verify_signature(&signed_bytes).unwrap();
    assert_eq!(verified.signer, "Presidente SIGP");
    let drift = (verified.signing_time - before_signing).num_seconds().abs();
    assert!(drift <= 5, "signing time drifted {drift}s from wall clock");

    // Audit trail is a single monotonic walk through the state machine.
    let events = service.audit_log().events_for(completed.contract_id).unwrap();
    let kinds: Vec<_> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        kinds,
        vec![
            AuditEventType::Generated,
            AuditEventType::PartnerSigned,
            AuditEventType::OfficerSigned,
        ]
    );
}

#[test]
fn officer_submission_before_partner_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write_p12(dir.path());
    let service = ContractService::new(settings(dir.path(), CERT_PASSWORD)).unwrap();

    let generated = service
        .generate(SubjectData {
            name: "Ana Gómez".to_string(),
            identity_document: None,
            address: None,
            email: None,
        })
        .unwrap();

    // A token that is itself valid for the officer role; only the state
    // guard stands in the way.
    let officer_token =
        TokenIssuer::new(TOKEN_SECRET, 60).issue(generated.contract_id, SigningRole::Officer);
    let err = service
        .submit_officer_signature(&officer_token, &signature_png(3))
        .unwrap_err();
    assert!(matches!(err, ContractError::IllegalTransition { .. }));

    let record = service.contract(generated.contract_id).unwrap();
    assert_eq!(record.state, ContractState::Generated);

    let events = service.audit_log().events_for(generated.contract_id).unwrap();
    assert!(events
        .iter()
        .all(|e| e.event_type != AuditEventType::OfficerSigned));
}

#[test]
fn wrong_certificate_password_leaves_partner_signed() {
    let dir = tempfile::tempdir().unwrap();
    write_p12(dir.path());
    // Valid pipeline configuration except for the certificate password.
    let service = ContractService::new(settings(dir.path(), "not-the-password")).unwrap();

    let generated = service
        .generate(SubjectData {
            name: "Ana Gómez".to_string(),
            identity_document: None,
            address: None,
            email: None,
        })
        .unwrap();
    let partner_link = generated.signing_link.unwrap();
    let partner = service
        .submit_partner_signature(token_from(&partner_link), &signature_png(4))
        .unwrap();

    let officer_link = partner.signing_link.unwrap();
    let err = service
        .submit_officer_signature(token_from(&officer_link), &signature_png(5))
        .unwrap_err();
    assert!(matches!(err, ContractError::CertificatePasswordInvalid));

    // Transition did not advance; exactly one failure event was recorded.
    let record = service.contract(generated.contract_id).unwrap();
    assert_eq!(record.state, ContractState::PartnerSigned);
    let events = service.audit_log().events_for(generated.contract_id).unwrap();
    let failures = events
        .iter()
        .filter(|e| e.event_type == AuditEventType::OfficerSigningFailed)
        .count();
    assert_eq!(failures, 1);
    assert!(events
        .iter()
        .all(|e| e.event_type != AuditEventType::OfficerSigned));
}

#[test]
fn racing_duplicate_partner_submissions_admit_exactly_one() {
    let dir = tempfile::tempdir().unwrap();
    write_p12(dir.path());
    let service = ContractService::new(settings(dir.path(), CERT_PASSWORD)).unwrap();

    let generated = service
        .generate(SubjectData {
            name: "Ana Gómez".to_string(),
            identity_document: None,
            address: None,
            email: None,
        })
        .unwrap();
    let link = generated.signing_link.unwrap();
    let token = token_from(&link);

    let barrier = std::sync::Barrier::new(2);
    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..2u8)
            .map(|seed| {
                let service = &service;
                let barrier = &barrier;
                s.spawn(move || {
                    let image = signature_png(seed);
                    barrier.wait();
                    service.submit_partner_signature(token, &image)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let rejected: Vec<_> = results.into_iter().filter_map(|r| r.err()).collect();
    assert_eq!(rejected.len(), 1);
    assert!(matches!(rejected[0], ContractError::IllegalTransition { .. }));

    let record = service.contract(generated.contract_id).unwrap();
    assert_eq!(record.state, ContractState::PartnerSigned);
}

#[test]
fn expired_partner_token_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write_p12(dir.path());
    let mut cfg = settings(dir.path(), CERT_PASSWORD);
    cfg.token_ttl_minutes = 0;
    let service = ContractService::new(cfg).unwrap();

    let generated = service
        .generate(SubjectData {
            name: "Ana Gómez".to_string(),
            identity_document: None,
            address: None,
            email: None,
        })
        .unwrap();
    let link = generated.signing_link.unwrap();
    std::thread::sleep(std::time::Duration::from_millis(1100));
    let err = service
        .submit_partner_signature(token_from(&link), &signature_png(6))
        .unwrap_err();
    assert!(matches!(err, ContractError::TokenExpired));
}
