//! Contract generation and dual-party e-signature pipeline.
//!
//! A contract is rendered from subject data, routed through two ordered
//! signers (the partner, then a company officer), stamped with each drawn
//! signature, annotated with a signing notice, and finally sealed with an
//! incorporated PAdES-style digital signature bound to a PKCS#12 certificate
//! bundle. Every transition is guarded by a role-scoped, time-boxed token and
//! recorded in an append-only audit log.

pub mod annotate;
pub mod audit;
pub mod config;
pub mod contract;
pub mod error;
pub mod metadata;
pub mod render;
pub mod signer;
pub mod stamp;
pub mod token;

pub use config::Settings;
pub use contract::{Contract, ContractReceipt, ContractService, ContractState};
pub use error::{ContractError, Result};
pub use render::{IdentityDocument, SubjectData};
pub use token::SigningRole;
