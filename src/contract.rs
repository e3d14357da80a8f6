use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{event, AuditEventType, AuditLog};
use crate::config::Settings;
use crate::error::{ContractError, Result};
use crate::metadata::{embed_metadata, DocumentMetadata};
use crate::render::{
    default_commission_table, render_contract, sha256_hex, SubjectData, OFFICER_BOX, PARTNER_BOX,
};
use crate::signer::{sign_document, CertificateBundle, DigestAlgorithm};
use crate::stamp::stamp_image;
use crate::token::{signing_link, SigningRole, TokenIssuer};

pub const ATTESTATION: &str =
    "El firmante declara haber leído y aceptado el contenido íntegro del presente contrato.";

/// Lifecycle of a contract. The tagged state is the single source of truth;
/// document paths and hashes are projections of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractState {
    Generated,
    PartnerSigned,
    /// Terminal. Nothing may touch the document after this.
    OfficerSigned,
}

impl ContractState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractState::Generated => "generated",
            ContractState::PartnerSigned => "partner_signed",
            ContractState::OfficerSigned => "officer_signed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    pub id: Uuid,
    pub subject: SubjectData,
    pub document_path: PathBuf,
    pub content_hash: String,
    pub state: ContractState,
    pub revision: u32,
    pub created_at: DateTime<Utc>,
}

/// What the caller gets back after each successful operation.
#[derive(Debug, Clone)]
pub struct ContractReceipt {
    pub contract_id: Uuid,
    pub document_uri: String,
    pub content_hash: String,
    pub state: ContractState,
    /// Link for the next signer in the sequence; absent once terminal.
    pub signing_link: Option<String>,
}

/// JSON-file backed store. The mutex is the single serialization point for
/// transitions: state is re-checked under the lock, so of two racing
/// submissions exactly one advances and the other is rejected.
struct ContractStore {
    dir: PathBuf,
    records: Mutex<HashMap<Uuid, Contract>>,
}

impl ContractStore {
    fn open(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        let mut records = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "json") {
                match serde_json::from_slice::<Contract>(&fs::read(&path)?) {
                    Ok(contract) => {
                        records.insert(contract.id, contract);
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping bad record"),
                }
            }
        }
        Ok(ContractStore {
            dir,
            records: Mutex::new(records),
        })
    }

    fn persist(&self, contract: &Contract) -> Result<()> {
        let path = self.dir.join(format!("{}.json", contract.id));
        let body = serde_json::to_vec_pretty(contract)
            .map_err(|e| ContractError::StorageFailed(format!("contract record serialize: {e}")))?;
        fs::write(path, body)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Contract>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Orchestrates the pipeline: render, token-gated stamping for each role in
/// order, and the final cryptographic signature. Every transition is guard
/// first, work second, state-advance-and-audit last.
pub struct ContractService {
    settings: Settings,
    store: ContractStore,
    audit: AuditLog,
    tokens: TokenIssuer,
}

impl ContractService {
    pub fn new(settings: Settings) -> Result<Self> {
        fs::create_dir_all(settings.data_dir.join("documents"))?;
        fs::create_dir_all(settings.data_dir.join("signatures"))?;
        let store = ContractStore::open(settings.data_dir.join("contracts"))?;
        let audit = AuditLog::new(settings.data_dir.join("audit.log"));
        let tokens = TokenIssuer::new(settings.token_secret.clone(), settings.token_ttl_minutes);
        Ok(ContractService {
            settings,
            store,
            audit,
            tokens,
        })
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    pub fn contract(&self, id: Uuid) -> Result<Contract> {
        self.store
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| ContractError::ContractNotFound(id.to_string()))
    }

    /// Renders the base contract, persists it and issues the partner's
    /// signing link.
    pub fn generate(&self, subject: SubjectData) -> Result<ContractReceipt> {
        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let bytes = render_contract(
            &subject,
            &default_commission_table(),
            created_at.date_naive(),
        )?;
        let content_hash = sha256_hex(&bytes);
        let document_path = self.revision_path(id, 0);
        fs::write(&document_path, &bytes)?;

        let contract = Contract {
            id,
            subject,
            document_path,
            content_hash: content_hash.clone(),
            state: ContractState::Generated,
            revision: 0,
            created_at,
        };
        self.store.persist(&contract)?;
        self.store.lock().insert(id, contract);

        // The transition is committed; the audit record must not undo it.
        self.audit.append_best_effort(&event(
            id,
            AuditEventType::Generated,
            json!({ "hash": content_hash }),
        ));
        info!(contract_id = %id, "contract generated");

        let token = self.tokens.issue(id, SigningRole::Partner);
        Ok(ContractReceipt {
            contract_id: id,
            document_uri: self.document_uri(id, 0),
            content_hash,
            state: ContractState::Generated,
            signing_link: Some(signing_link(
                &self.settings.public_base_url,
                SigningRole::Partner,
                &token,
            )),
        })
    }

    /// Partner's turn: verify the token, stamp the drawn signature into the
    /// partner box, advance to `PartnerSigned`, hand out the officer link.
    pub fn submit_partner_signature(
        &self,
        token: &str,
        image_bytes: &[u8],
    ) -> Result<ContractReceipt> {
        let id = self.tokens.verify(token, SigningRole::Partner).map_err(|e| {
            warn!(error = %e, "partner token rejected");
            e
        })?;

        let mut records = self.store.lock();
        let contract = records
            .get(&id)
            .ok_or_else(|| ContractError::ContractNotFound(id.to_string()))?
            .clone();
        // Guard before any stamping work.
        if contract.state != ContractState::Generated {
            warn!(contract_id = %id, state = contract.state.as_str(), "partner submission rejected");
            return Err(ContractError::IllegalTransition {
                from: contract.state.as_str().to_string(),
                attempted: "partner_signed".to_string(),
            });
        }

        let outcome = self.apply_partner_stamp(&contract, image_bytes);
        match outcome {
            Ok(updated) => {
                let hash = updated.content_hash.clone();
                let revision = updated.revision;
                self.store.persist(&updated)?;
                records.insert(id, updated);
                drop(records);
                self.audit.append_best_effort(&event(
                    id,
                    AuditEventType::PartnerSigned,
                    json!({ "hash": hash }),
                ));
                info!(contract_id = %id, "partner signature applied");

                let token = self.tokens.issue(id, SigningRole::Officer);
                Ok(ContractReceipt {
                    contract_id: id,
                    document_uri: self.document_uri(id, revision),
                    content_hash: hash,
                    state: ContractState::PartnerSigned,
                    signing_link: Some(signing_link(
                        &self.settings.public_base_url,
                        SigningRole::Officer,
                        &token,
                    )),
                })
            }
            Err(e) => {
                drop(records);
                self.audit.append_best_effort(&event(
                    id,
                    AuditEventType::PartnerSigningFailed,
                    json!({ "error": e.to_string() }),
                ));
                Err(e)
            }
        }
    }

    /// Officer's turn, the terminal transition: stamp, annotate the signing
    /// notice, embed metadata, then apply the cryptographic signature. Any
    /// failure leaves the contract in `PartnerSigned`.
    pub fn submit_officer_signature(
        &self,
        token: &str,
        image_bytes: &[u8],
    ) -> Result<ContractReceipt> {
        let id = self.tokens.verify(token, SigningRole::Officer).map_err(|e| {
            warn!(error = %e, "officer token rejected");
            e
        })?;

        let mut records = self.store.lock();
        let contract = records
            .get(&id)
            .ok_or_else(|| ContractError::ContractNotFound(id.to_string()))?
            .clone();
        if contract.state != ContractState::PartnerSigned {
            warn!(contract_id = %id, state = contract.state.as_str(), "officer submission rejected");
            return Err(ContractError::IllegalTransition {
                from: contract.state.as_str().to_string(),
                attempted: "officer_signed".to_string(),
            });
        }

        match self.apply_officer_signature(&contract, image_bytes) {
            Ok(updated) => {
                let hash = updated.content_hash.clone();
                let revision = updated.revision;
                self.store.persist(&updated)?;
                records.insert(id, updated);
                drop(records);
                self.audit.append_best_effort(&event(
                    id,
                    AuditEventType::OfficerSigned,
                    json!({ "hash": hash }),
                ));
                info!(contract_id = %id, "contract completed and digitally signed");
                Ok(ContractReceipt {
                    contract_id: id,
                    document_uri: self.document_uri(id, revision),
                    content_hash: hash,
                    state: ContractState::OfficerSigned,
                    signing_link: None,
                })
            }
            Err(e) => {
                drop(records);
                self.audit.append_best_effort(&event(
                    id,
                    AuditEventType::OfficerSigningFailed,
                    json!({ "error": e.to_string() }),
                ));
                Err(e)
            }
        }
    }

    fn apply_partner_stamp(&self, contract: &Contract, image_bytes: &[u8]) -> Result<Contract> {
        let source = self.read_document(contract)?;
        self.save_signature_asset(contract.id, SigningRole::Partner, image_bytes)?;

        let last_page = page_count(&source)?;
        let stamped = stamp_image(
            &source,
            image_bytes,
            last_page,
            PARTNER_BOX.into(),
            self.settings.page_mode,
        )?;

        self.write_revision(contract, stamped, ContractState::PartnerSigned)
    }

    fn apply_officer_signature(&self, contract: &Contract, image_bytes: &[u8]) -> Result<Contract> {
        let source = self.read_document(contract)?;
        self.save_signature_asset(contract.id, SigningRole::Officer, image_bytes)?;

        let last_page = page_count(&source)?;
        let now = Utc::now();

        let stamped = stamp_image(
            &source,
            image_bytes,
            last_page,
            OFFICER_BOX.into(),
            self.settings.page_mode,
        )?;

        let notice = vec![
            format!("Firmado por: {}", self.settings.officer_name),
            format!("Fecha: {} UTC", now.format("%Y-%m-%d %H:%M:%S")),
            ATTESTATION.to_string(),
        ];
        let annotated = crate::annotate::annotate_text(
            &stamped,
            &notice,
            last_page,
            (72.0, 8.0, 460.0, 44.0).into(),
            self.settings.page_mode,
        )?;

        let meta = DocumentMetadata {
            title: format!("Contrato de Prescripción - {}", contract.subject.name),
            author: contract.subject.name.clone(),
            subject: "Contrato de prescripción".to_string(),
            keywords: "contrato, prescriptor, firma electrónica".to_string(),
            creator: "SIGP".to_string(),
            producer: "sigp-contracts".to_string(),
            created: contract.created_at,
            modified: now,
        };
        let with_meta = embed_metadata(&annotated, &meta)?;

        // Certificate material is loaded fresh per operation and dropped
        // with it.
        let digest = DigestAlgorithm::from_name(&self.settings.digest_algorithm)?;
        let bundle = CertificateBundle::load(
            &self.settings.certificate_path,
            &self.settings.certificate_password,
        )?;
        let signed = sign_document(&with_meta, &bundle, digest, now)?;

        self.write_revision(contract, signed, ContractState::OfficerSigned)
    }

    fn read_document(&self, contract: &Contract) -> Result<Vec<u8>> {
        fs::read(&contract.document_path).map_err(|_| {
            ContractError::SourceDocumentMissing(contract.document_path.display().to_string())
        })
    }

    /// Signature assets are written once and never deleted; a superseded
    /// image stays on disk for audit.
    fn save_signature_asset(&self, id: Uuid, role: SigningRole, image_bytes: &[u8]) -> Result<()> {
        let name = format!(
            "{id}_{}_{}.png",
            role.as_str(),
            Utc::now().format("%Y%m%d%H%M%S%f")
        );
        fs::write(self.settings.data_dir.join("signatures").join(name), image_bytes)?;
        Ok(())
    }

    fn write_revision(
        &self,
        contract: &Contract,
        bytes: Vec<u8>,
        state: ContractState,
    ) -> Result<Contract> {
        let revision = contract.revision + 1;
        let path = self.revision_path(contract.id, revision);
        fs::write(&path, &bytes)?;
        Ok(Contract {
            id: contract.id,
            subject: contract.subject.clone(),
            document_path: path,
            content_hash: sha256_hex(&bytes),
            state,
            revision,
            created_at: contract.created_at,
        })
    }

    fn revision_path(&self, id: Uuid, revision: u32) -> PathBuf {
        self.settings
            .data_dir
            .join("documents")
            .join(format!("contract_{id}_v{revision}.pdf"))
    }

    fn document_uri(&self, id: Uuid, revision: u32) -> String {
        format!(
            "{}/static/contracts/contract_{id}_v{revision}.pdf",
            self.settings.public_base_url.trim_end_matches('/')
        )
    }
}

fn page_count(pdf: &[u8]) -> Result<u32> {
    let doc = lopdf::Document::load_mem(pdf)
        .map_err(|e| ContractError::RenderingFailed(format!("document load: {e}")))?;
    Ok(doc.get_pages().len() as u32)
}
