//! Core row model, table catalog, and identity utilities for staffdir.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod states;

pub use states::US_STATES;

pub const CRATE_NAME: &str = "staffdir-core";

/// Sentinel id used by "delete everything" filters; no real row carries it.
pub const NIL_ID: Uuid = Uuid::nil();

/// Natural key (name or state code) to store-generated id.
pub type IdMap = BTreeMap<String, Uuid>;

/// Tables the seeding pipeline touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Trades,
    Regions,
    Agencies,
    AgencyCompliance,
    AgencyTrades,
    AgencyRegions,
    AgencyIntegrationEvents,
    AgencyIntegrationSyncs,
    AgencyIntegrations,
}

impl Table {
    pub const ALL: [Table; 9] = [
        Table::Trades,
        Table::Regions,
        Table::Agencies,
        Table::AgencyCompliance,
        Table::AgencyTrades,
        Table::AgencyRegions,
        Table::AgencyIntegrationEvents,
        Table::AgencyIntegrationSyncs,
        Table::AgencyIntegrations,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Table::Trades => "trades",
            Table::Regions => "regions",
            Table::Agencies => "agencies",
            Table::AgencyCompliance => "agency_compliance",
            Table::AgencyTrades => "agency_trades",
            Table::AgencyRegions => "agency_regions",
            Table::AgencyIntegrationEvents => "agency_integration_events",
            Table::AgencyIntegrationSyncs => "agency_integration_syncs",
            Table::AgencyIntegrations => "agency_integrations",
        }
    }

    /// Column a reset filters on. Junction and integration tables have no
    /// surrogate id, so they are cleared through their agency reference.
    pub const fn key_column(self) -> &'static str {
        match self {
            Table::Trades | Table::Regions | Table::Agencies => "id",
            _ => "agency_id",
        }
    }

    /// Integration tables exist only in some environments.
    pub const fn is_speculative(self) -> bool {
        matches!(
            self,
            Table::AgencyIntegrationEvents
                | Table::AgencyIntegrationSyncs
                | Table::AgencyIntegrations
        )
    }

    /// Foreign keys held by rows of this table, as `(column, parent table)`.
    pub const fn references(self) -> &'static [(&'static str, Table)] {
        match self {
            Table::Trades | Table::Regions | Table::Agencies => &[],
            Table::AgencyCompliance | Table::AgencyIntegrations => {
                &[("agency_id", Table::Agencies)]
            }
            Table::AgencyTrades => &[
                ("agency_id", Table::Agencies),
                ("trade_id", Table::Trades),
            ],
            Table::AgencyRegions => &[
                ("agency_id", Table::Agencies),
                ("region_id", Table::Regions),
            ],
            Table::AgencyIntegrationEvents | Table::AgencyIntegrationSyncs => &[
                ("agency_id", Table::Agencies),
                ("integration_id", Table::AgencyIntegrations),
            ],
        }
    }

    pub fn from_name(name: &str) -> Option<Table> {
        Table::ALL.into_iter().find(|t| t.name() == name)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// URL-safe identifier derived from a display name.
///
/// Lowercases, spells out `&`, drops apostrophes, and collapses every other run
/// of non-alphanumeric characters into a single hyphen.
pub fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_hyphen = false;
    for ch in input.replace('&', " and ").chars() {
        if ch == '\'' || ch == '\u{2019}' {
            continue;
        }
        if ch.is_ascii_alphanumeric() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTrade {
    pub name: String,
    pub slug: String,
}

impl NewTrade {
    pub fn from_name(name: &str) -> Self {
        Self {
            name: name.to_string(),
            slug: slugify(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRegion {
    pub name: String,
    pub state_code: String,
    pub slug: String,
}

impl NewRegion {
    pub fn new(name: &str, state_code: &str) -> Self {
        Self {
            name: name.to_string(),
            state_code: state_code.to_string(),
            slug: slugify(name),
        }
    }
}

/// Agency row as inserted. Seeded agencies are always unclaimed and active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAgency {
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub logo_url: Option<String>,
    pub website: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub is_claimed: bool,
    pub is_active: bool,
    pub offers_per_diem: bool,
    pub is_union: bool,
    pub founded_year: Option<i32>,
    pub employee_count: Option<String>,
    pub headquarters: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewComplianceRecord {
    pub agency_id: Uuid,
    pub compliance_type: String,
    pub is_active: bool,
    pub is_verified: bool,
    pub expiration_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgencyTradeLink {
    pub agency_id: Uuid,
    pub trade_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgencyRegionLink {
    pub agency_id: Uuid,
    pub region_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_punctuation_and_case() {
        assert_eq!(slugify("Apex Staffing"), "apex-staffing");
        assert_eq!(slugify("  HVAC / Refrigeration Tech "), "hvac-refrigeration-tech");
        assert_eq!(slugify("O'Brien & Sons, LLC"), "obrien-and-sons-llc");
        assert_eq!(slugify("---"), "");
    }

    #[test]
    fn table_names_round_trip() {
        for table in Table::ALL {
            assert_eq!(Table::from_name(table.name()), Some(table));
        }
        assert_eq!(Table::from_name("users"), None);
    }

    #[test]
    fn junction_tables_reference_their_parents() {
        let parents: Vec<Table> = Table::AgencyTrades
            .references()
            .iter()
            .map(|(_, parent)| *parent)
            .collect();
        assert_eq!(parents, vec![Table::Agencies, Table::Trades]);
        assert!(Table::Trades.references().is_empty());
        assert_eq!(Table::AgencyRegions.key_column(), "agency_id");
        assert_eq!(Table::Regions.key_column(), "id");
    }

    #[test]
    fn new_agency_serializes_with_snake_case_columns() {
        let now = Utc::now();
        let row = NewAgency {
            name: "Apex Staffing".into(),
            slug: slugify("Apex Staffing"),
            description: None,
            logo_url: None,
            website: None,
            phone: None,
            email: None,
            is_claimed: false,
            is_active: true,
            offers_per_diem: true,
            is_union: false,
            founded_year: Some(2004),
            employee_count: Some("50-100".into()),
            headquarters: Some("Houston, TX".into()),
            created_at: now,
            updated_at: now,
        };
        let value = serde_json::to_value(&row).expect("serialize");
        assert_eq!(value["slug"], "apex-staffing");
        assert_eq!(value["is_claimed"], false);
        assert_eq!(value["created_at"], value["updated_at"]);
    }
}
