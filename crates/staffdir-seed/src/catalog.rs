//! Immutable reference catalog: canonical trades, state codes, and agency fixtures.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use staffdir_core::US_STATES;
use thiserror::Error;

const BUILTIN_CATALOG: &str = include_str!("../fixtures/catalog.yaml");

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("reading catalog {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing catalog {origin}: {message}")]
    Parse { origin: String, message: String },
    #[error("encoding catalog: {0}")]
    Encode(String),
    #[error("unsupported catalog format for {0} (expected .yaml, .yml or .json)")]
    UnsupportedFormat(PathBuf),
    #[error("blank {0} in catalog")]
    BlankName(String),
    #[error("agency \"{0}\" is listed more than once")]
    DuplicateAgency(String),
    #[error("agency \"{agency}\" lists {kind} \"{value}\" more than once")]
    DuplicateEntry {
        agency: String,
        kind: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceFixture {
    pub compliance_type: String,
    #[serde(default)]
    pub is_verified: bool,
    #[serde(default)]
    pub expiration_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgencyFixture {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub logo_url: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub offers_per_diem: bool,
    #[serde(default)]
    pub is_union: bool,
    #[serde(default)]
    pub founded_year: Option<i32>,
    #[serde(default)]
    pub employee_count: Option<String>,
    #[serde(default)]
    pub headquarters: Option<String>,
    #[serde(default)]
    pub trades: Vec<String>,
    /// State display names, resolved to codes through the catalog's state table.
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub compliance: Vec<ComplianceFixture>,
}

fn default_states() -> BTreeMap<String, String> {
    US_STATES
        .iter()
        .map(|(name, code)| (name.to_string(), code.to_string()))
        .collect()
}

/// Everything the seeders read. Loaded once and passed by reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceCatalog {
    #[serde(default)]
    pub trades: Vec<String>,
    /// State display name to two-letter code.
    #[serde(default = "default_states")]
    pub states: BTreeMap<String, String>,
    #[serde(default)]
    pub agencies: Vec<AgencyFixture>,
}

impl ReferenceCatalog {
    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_yaml_str(BUILTIN_CATALOG, "built-in catalog")
    }

    /// Load a YAML or JSON catalog, chosen by file extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let origin = path.display().to_string();
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&text, &origin),
            Some("json") => {
                let catalog: Self =
                    serde_json::from_str(&text).map_err(|e| CatalogError::Parse {
                        origin,
                        message: e.to_string(),
                    })?;
                catalog.validate()?;
                Ok(catalog)
            }
            _ => Err(CatalogError::UnsupportedFormat(path.to_path_buf())),
        }
    }

    pub fn from_yaml_str(text: &str, origin: &str) -> Result<Self, CatalogError> {
        let catalog: Self = serde_yaml::from_str(text).map_err(|e| CatalogError::Parse {
            origin: origin.to_string(),
            message: e.to_string(),
        })?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Reject fixtures whose natural keys collide. Conflicting duplicates would
    /// otherwise resolve by whichever batch ran first.
    pub fn validate(&self) -> Result<(), CatalogError> {
        if let Some(blank) = self.trades.iter().find(|t| t.trim().is_empty()) {
            return Err(CatalogError::BlankName(format!("trade name {blank:?}")));
        }

        let mut agency_names = BTreeSet::new();
        for agency in &self.agencies {
            if agency.name.trim().is_empty() {
                return Err(CatalogError::BlankName("agency name".to_string()));
            }
            if !agency_names.insert(agency.name.as_str()) {
                return Err(CatalogError::DuplicateAgency(agency.name.clone()));
            }
            check_unique(&agency.name, "trade", agency.trades.iter().map(String::as_str))?;
            check_unique(&agency.name, "region", agency.regions.iter().map(String::as_str))?;
            check_unique(
                &agency.name,
                "compliance type",
                agency.compliance.iter().map(|c| c.compliance_type.as_str()),
            )?;
        }
        Ok(())
    }

    /// State-table display name and two-letter code for a state name,
    /// matched case-insensitively.
    pub fn state_entry(&self, name: &str) -> Option<(&str, &str)> {
        let name = name.trim();
        self.states
            .iter()
            .find(|(state, _)| state.eq_ignore_ascii_case(name))
            .filter(|(_, code)| !code.trim().is_empty())
            .map(|(state, code)| (state.as_str(), code.as_str()))
    }

    pub fn state_code(&self, name: &str) -> Option<&str> {
        self.state_entry(name).map(|(_, code)| code)
    }

    /// Stored spelling of every trade, keyed by its lowercase form. The
    /// canonical list's spelling wins, then the first agency reference.
    pub fn trade_spellings(&self) -> BTreeMap<String, String> {
        let mut spellings = BTreeMap::new();
        for name in self
            .trades
            .iter()
            .chain(self.agencies.iter().flat_map(|a| a.trades.iter()))
        {
            let name = name.trim();
            spellings
                .entry(name.to_lowercase())
                .or_insert_with(|| name.to_string());
        }
        spellings
    }

    /// Canonical trades plus every trade an agency references, one spelling
    /// per trade regardless of case.
    pub fn trade_names(&self) -> BTreeSet<String> {
        self.trade_spellings().into_values().collect()
    }

    /// Every state display name any agency operates in, de-duplicated.
    pub fn region_names(&self) -> BTreeSet<String> {
        self.agencies
            .iter()
            .flat_map(|a| a.regions.iter())
            .map(|r| r.trim().to_string())
            .collect()
    }

    /// Region state codes that resolve through the state table.
    pub fn region_codes(&self) -> BTreeSet<String> {
        self.region_names()
            .iter()
            .filter_map(|name| self.state_code(name))
            .map(str::to_string)
            .collect()
    }

    pub fn expected_compliance_records(&self) -> usize {
        self.agencies.iter().map(|a| a.compliance.len()).sum()
    }

    pub fn expected_trade_links(&self) -> usize {
        self.agencies.iter().map(|a| a.trades.len()).sum()
    }

    /// Region links whose state names resolve to a code.
    pub fn expected_region_links(&self) -> usize {
        self.agencies
            .iter()
            .flat_map(|a| a.regions.iter())
            .filter(|r| self.state_code(r).is_some())
            .count()
    }

    /// sha256 of the canonical JSON encoding.
    pub fn fingerprint(&self) -> Result<String, CatalogError> {
        let bytes = serde_json::to_vec(self).map_err(|e| CatalogError::Encode(e.to_string()))?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }
}

fn check_unique<'a>(
    agency: &str,
    kind: &'static str,
    values: impl Iterator<Item = &'a str>,
) -> Result<(), CatalogError> {
    let mut seen = BTreeSet::new();
    for value in values {
        if value.trim().is_empty() {
            return Err(CatalogError::BlankName(format!("{kind} for agency \"{agency}\"")));
        }
        if !seen.insert(value.trim().to_ascii_lowercase()) {
            return Err(CatalogError::DuplicateEntry {
                agency: agency.to_string(),
                kind,
                value: value.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn builtin_catalog_parses_and_validates() {
        let catalog = ReferenceCatalog::builtin().expect("builtin catalog");
        assert!(!catalog.agencies.is_empty());
        assert_eq!(catalog.states.len(), 51);
        let apex = catalog
            .agencies
            .iter()
            .find(|a| a.name == "Apex Staffing")
            .expect("apex fixture");
        assert_eq!(apex.trades, vec!["Welder", "Electrician"]);
        assert_eq!(
            apex.compliance[0].expiration_date,
            NaiveDate::from_ymd_opt(2027, 6, 30)
        );
        assert!(catalog.trade_names().contains("Welder"));
        assert_eq!(catalog.region_codes().len(), catalog.region_names().len());
    }

    #[test]
    fn duplicate_agencies_are_rejected() {
        let yaml = r#"
trades: [Welder]
agencies:
  - name: Apex Staffing
    headquarters: Houston, TX
  - name: Apex Staffing
    headquarters: Dallas, TX
"#;
        let err = ReferenceCatalog::from_yaml_str(yaml, "test").expect_err("duplicate");
        assert!(matches!(err, CatalogError::DuplicateAgency(ref name) if name == "Apex Staffing"));
    }

    #[test]
    fn duplicate_trades_within_an_agency_are_rejected() {
        let yaml = r#"
agencies:
  - name: Apex Staffing
    trades: [Welder, welder]
"#;
        let err = ReferenceCatalog::from_yaml_str(yaml, "test").expect_err("duplicate trade");
        assert!(matches!(err, CatalogError::DuplicateEntry { kind: "trade", .. }));
    }

    #[test]
    fn trade_names_union_canonical_and_referenced() {
        let yaml = r#"
trades: [Welder, Roofer]
agencies:
  - name: Apex Staffing
    trades: [Welder, Electrician]
    regions: [Texas, Atlantis]
"#;
        let catalog = ReferenceCatalog::from_yaml_str(yaml, "test").expect("catalog");
        let names: Vec<String> = catalog.trade_names().into_iter().collect();
        assert_eq!(names, vec!["Electrician", "Roofer", "Welder"]);
        assert_eq!(catalog.region_codes().into_iter().collect::<Vec<_>>(), vec!["TX"]);
        assert_eq!(catalog.expected_region_links(), 1);
        assert_eq!(catalog.expected_trade_links(), 2);
    }

    #[test]
    fn json_catalogs_load_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("catalog.json");
        let mut file = fs::File::create(&path).expect("create");
        write!(
            file,
            r#"{{"trades": ["Welder"], "agencies": [{{"name": "Apex Staffing", "trades": ["Welder"]}}]}}"#
        )
        .expect("write");

        let catalog = ReferenceCatalog::load(&path).expect("load");
        assert_eq!(catalog.agencies.len(), 1);
        assert_eq!(catalog.state_code("texas"), Some("TX"));

        let err = ReferenceCatalog::load(dir.path().join("catalog.toml")).expect_err("missing");
        assert!(matches!(err, CatalogError::Read { .. }));
    }

    #[test]
    fn fingerprint_tracks_content() {
        let a = ReferenceCatalog::builtin().expect("builtin");
        let mut b = a.clone();
        let fingerprint = a.fingerprint().expect("fingerprint");
        assert_eq!(fingerprint, b.fingerprint().expect("fingerprint"));
        b.trades.push("Tile Setter".into());
        assert_ne!(fingerprint, b.fingerprint().expect("fingerprint"));
        assert_eq!(fingerprint.len(), 64);
    }

    #[test]
    fn trade_references_take_the_canonical_spelling() {
        let yaml = r#"
trades: [Welder]
agencies:
  - name: Apex Staffing
    trades: [welder, pipefitter]
  - name: Ironclad Workforce
    trades: [Pipefitter, " WELDER "]
"#;
        let catalog = ReferenceCatalog::from_yaml_str(yaml, "test").expect("catalog");
        let names: Vec<String> = catalog.trade_names().into_iter().collect();
        assert_eq!(names, vec!["Welder", "pipefitter"]);
        let spellings = catalog.trade_spellings();
        assert_eq!(spellings["welder"], "Welder");
        assert_eq!(spellings["pipefitter"], "pipefitter");
    }

    #[test]
    fn state_entry_returns_the_table_spelling() {
        let catalog = ReferenceCatalog::builtin().expect("builtin");
        assert_eq!(catalog.state_entry(" texas "), Some(("Texas", "TX")));
        assert_eq!(catalog.state_entry("new MEXICO"), Some(("New Mexico", "NM")));
        assert_eq!(catalog.state_entry("Atlantis"), None);
    }
}
