//! Idempotent seeding, reset, and verification of the staffing directory store.

use std::fmt;

use serde::Serialize;
use staffdir_core::Table;
use staffdir_storage::StoreError;
use thiserror::Error;

pub mod catalog;
pub mod config;
pub mod entities;
pub mod links;
pub mod pipeline;
pub mod reset;
pub mod verify;

pub use catalog::{AgencyFixture, CatalogError, ComplianceFixture, ReferenceCatalog};
pub use config::{connect_and_probe, SeedConfig, StoreBackend};
pub use entities::{seed_agencies, seed_compliance, seed_regions, seed_trades, EntitySeed};
pub use links::{link_agency_regions, link_agency_trades};
pub use pipeline::{
    run_seed, run_verify, validate_stage_order, BatchSizes, PipelineOptions, SeedPipeline,
    SeedRunSummary, Stage, StageReport, SEED_ORDER,
};
pub use reset::{reset_store, validate_reset_order, ResetOutcome, ResetReport, TableReset, RESET_ORDER};
pub use verify::{verify_store, VerificationCheck, VerificationReport};

pub const CRATE_NAME: &str = "staffdir-seed";

/// What kind of natural key failed to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Agency,
    Trade,
    StateName,
    Region,
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReferenceKind::Agency => "agency",
            ReferenceKind::Trade => "trade",
            ReferenceKind::StateName => "state name",
            ReferenceKind::Region => "region",
        })
    }
}

/// A fixture reference that could not be mapped to a stored id. Skipped rows
/// are always recorded as one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnresolvedReference {
    pub kind: ReferenceKind,
    pub natural_key: String,
    /// Agency whose fixture carried the reference, when there is one.
    pub agency: Option<String>,
    /// Closest known key, if any is similar enough to be a likely typo.
    pub suggestion: Option<String>,
}

impl fmt::Display for UnresolvedReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unresolved {} \"{}\"", self.kind, self.natural_key)?;
        if let Some(agency) = &self.agency {
            write!(f, " for agency \"{agency}\"")?;
        }
        if let Some(suggestion) = &self.suggestion {
            write!(f, " (did you mean \"{suggestion}\"?)")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("store unreachable after {attempts} attempt(s): {message}")]
    Connectivity { attempts: usize, message: String },
    #[error("{operation} on {table} failed: {source}")]
    StoreOperation {
        table: Table,
        operation: &'static str,
        source: StoreError,
    },
    #[error("{0}")]
    Resolution(UnresolvedReference),
}

impl SeedError {
    pub(crate) fn store(table: Table, operation: &'static str) -> impl FnOnce(StoreError) -> SeedError {
        move |source| SeedError::StoreOperation {
            table,
            operation,
            source,
        }
    }
}

impl From<CatalogError> for SeedError {
    fn from(err: CatalogError) -> Self {
        SeedError::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unresolved_reference_names_the_offending_key() {
        let unresolved = UnresolvedReference {
            kind: ReferenceKind::StateName,
            natural_key: "Texas".into(),
            agency: Some("Apex Staffing".into()),
            suggestion: None,
        };
        assert_eq!(
            unresolved.to_string(),
            "unresolved state name \"Texas\" for agency \"Apex Staffing\""
        );
        let err = SeedError::Resolution(unresolved);
        assert!(err.to_string().contains("Texas"));
    }

    #[test]
    fn store_errors_carry_the_table_name() {
        let err = SeedError::store(Table::Agencies, "insert")(StoreError::Unavailable("down".into()));
        assert_eq!(
            err.to_string(),
            "insert on agencies failed: store unavailable: down"
        );
    }
}
