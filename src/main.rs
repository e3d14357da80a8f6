use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sigp_contracts::{ContractService, Settings, SubjectData};

/// Drives the whole pipeline once, end to end: generate, partner stamp,
/// officer stamp + digital signature. The signature images come from files
/// named on the command line so the flow can be exercised against a real
/// certificate bundle.
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut args = std::env::args().skip(1);
    let partner_sig = args.next().context("usage: sigp-contracts <partner_signature.png> <officer_signature.png> [config.toml]")?;
    let officer_sig = args.next().context("missing officer signature image")?;
    let config_path = args.next().unwrap_or_else(|| "config.toml".to_string());

    let settings = Settings::load(Path::new(&config_path))?;
    let service = ContractService::new(settings)?;

    let subject = SubjectData {
        name: "Ana Gómez".to_string(),
        identity_document: None,
        address: None,
        email: None,
    };

    let receipt = service.generate(subject)?;
    info!(contract_id = %receipt.contract_id, hash = %receipt.content_hash, "generated");
    let partner_link = receipt.signing_link.context("partner link missing")?;
    let partner_token = extract_token(&partner_link)?;

    let partner_image = std::fs::read(&partner_sig)
        .with_context(|| format!("reading partner signature {partner_sig}"))?;
    let receipt = service.submit_partner_signature(partner_token, &partner_image)?;
    info!(hash = %receipt.content_hash, "partner signed");
    let officer_link = receipt.signing_link.context("officer link missing")?;
    let officer_token = extract_token(&officer_link)?;

    let officer_image = std::fs::read(&officer_sig)
        .with_context(|| format!("reading officer signature {officer_sig}"))?;
    let receipt = service.submit_officer_signature(officer_token, &officer_image)?;
    info!(
        hash = %receipt.content_hash,
        uri = %receipt.document_uri,
        "contract completed with embedded digital signature"
    );
    Ok(())
}

fn extract_token(link: &str) -> Result<&str> {
    link.split("token=")
        .nth(1)
        .context("signing link carries no token")
}
