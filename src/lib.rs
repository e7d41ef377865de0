//! form13f: follow-the-filer backtests over quarterly 13F holdings disclosures.
//!
//! Hexagonal architecture: domain logic in [`domain`], collaborator traits in
//! [`ports`], concrete implementations in [`adapters`].

pub mod domain;
pub mod ports;
pub mod adapters;
pub mod cli;
