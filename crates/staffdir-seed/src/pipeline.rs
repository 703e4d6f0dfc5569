//! Seed run orchestration: probe, optional reset, the stage sequence, and the
//! optional audit, with a JSON run summary.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use staffdir_core::{IdMap, Table};
use staffdir_storage::Store;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::catalog::ReferenceCatalog;
use crate::config::{connect_and_probe, SeedConfig};
use crate::entities::{seed_agencies, seed_compliance, seed_regions, seed_trades, EntitySeed};
use crate::links::{link_agency_regions, link_agency_trades, LinkSeed};
use crate::reset::{reset_store, ResetReport};
use crate::verify::{verify_store, VerificationReport};
use crate::{SeedError, UnresolvedReference};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Trades,
    Regions,
    Agencies,
    Compliance,
    AgencyTrades,
    AgencyRegions,
}

/// Stages in execution order. Every stage follows the stages it reads ids from.
pub const SEED_ORDER: [Stage; 6] = [
    Stage::Trades,
    Stage::Regions,
    Stage::Agencies,
    Stage::Compliance,
    Stage::AgencyTrades,
    Stage::AgencyRegions,
];

impl Stage {
    pub const fn name(self) -> &'static str {
        match self {
            Stage::Trades => "trades",
            Stage::Regions => "regions",
            Stage::Agencies => "agencies",
            Stage::Compliance => "compliance",
            Stage::AgencyTrades => "agency_trades",
            Stage::AgencyRegions => "agency_regions",
        }
    }

    pub const fn table(self) -> Table {
        match self {
            Stage::Trades => Table::Trades,
            Stage::Regions => Table::Regions,
            Stage::Agencies => Table::Agencies,
            Stage::Compliance => Table::AgencyCompliance,
            Stage::AgencyTrades => Table::AgencyTrades,
            Stage::AgencyRegions => Table::AgencyRegions,
        }
    }

    /// Stages whose id maps this stage consumes.
    pub const fn depends_on(self) -> &'static [Stage] {
        match self {
            Stage::Trades | Stage::Regions | Stage::Agencies => &[],
            Stage::Compliance => &[Stage::Agencies],
            Stage::AgencyTrades => &[Stage::Agencies, Stage::Trades],
            Stage::AgencyRegions => &[Stage::Agencies, Stage::Regions],
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reject a stage list that repeats a stage or runs one before its dependencies.
pub fn validate_stage_order(order: &[Stage]) -> Result<(), SeedError> {
    for (position, stage) in order.iter().enumerate() {
        if order[..position].contains(stage) {
            return Err(SeedError::Configuration(format!("stage {stage} is listed twice")));
        }
        for dependency in stage.depends_on() {
            if !order[..position].contains(dependency) {
                return Err(SeedError::Configuration(format!(
                    "stage {stage} runs before {dependency}, which it depends on"
                )));
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchSizes {
    pub trades: usize,
    pub regions: usize,
    pub agencies: usize,
    /// Compliance records and both junction tables.
    pub links: usize,
}

impl Default for BatchSizes {
    fn default() -> Self {
        Self {
            trades: 10,
            regions: 10,
            agencies: 20,
            links: 50,
        }
    }
}

impl BatchSizes {
    pub fn uniform(size: usize) -> Self {
        Self {
            trades: size,
            regions: size,
            agencies: size,
            links: size,
        }
    }

    pub fn for_stage(&self, stage: Stage) -> usize {
        match stage {
            Stage::Trades => self.trades,
            Stage::Regions => self.regions,
            Stage::Agencies => self.agencies,
            Stage::Compliance | Stage::AgencyTrades | Stage::AgencyRegions => self.links,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineOptions {
    pub reset: bool,
    pub verify: bool,
    /// Fail the run when any fixture reference stayed unresolved.
    pub strict: bool,
    pub batch_sizes: BatchSizes,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub table: Table,
    pub created: usize,
    pub skipped: usize,
    pub unresolved: Vec<UnresolvedReference>,
}

impl StageReport {
    fn from_entities(stage: Stage, seed: &EntitySeed) -> Self {
        Self {
            stage,
            table: stage.table(),
            created: seed.created,
            skipped: seed.skipped,
            unresolved: seed.unresolved.clone(),
        }
    }

    fn from_links(stage: Stage, seed: LinkSeed) -> Self {
        Self {
            stage,
            table: stage.table(),
            created: seed.created,
            skipped: seed.skipped,
            unresolved: seed.unresolved,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SeedRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub backend: String,
    pub catalog_fingerprint: String,
    pub reset: Option<ResetReport>,
    pub stages: Vec<StageReport>,
    pub verification: Option<VerificationReport>,
}

impl SeedRunSummary {
    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    pub fn total_created(&self) -> usize {
        self.stages.iter().map(|s| s.created).sum()
    }

    pub fn total_unresolved(&self) -> usize {
        self.stages.iter().map(|s| s.unresolved.len()).sum()
    }

    /// `trades +3/=25 regions +0/=10 ...`: created and skipped per stage.
    pub fn one_line(&self) -> String {
        let stages = self
            .stages
            .iter()
            .map(|s| format!("{} +{}/={}", s.stage, s.created, s.skipped))
            .collect::<Vec<_>>()
            .join(" ");
        let mut line = format!("run {}: {stages} unresolved={}", self.run_id, self.total_unresolved());
        if let Some(reset) = &self.reset {
            line.push_str(&format!(" reset_deleted={}", reset.total_deleted()));
        }
        if let Some(verification) = &self.verification {
            line.push_str(if verification.passed {
                " verification=passed"
            } else {
                " verification=failed"
            });
        }
        line
    }

    /// Write `<dir>/<run_id>/seed_summary.json` and return its path.
    pub async fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        let run_dir = dir.join(self.run_id.to_string());
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;
        let path = run_dir.join("seed_summary.json");
        let body = serde_json::to_vec_pretty(self).context("serializing seed summary")?;
        fs::write(&path, body)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

pub struct SeedPipeline<'a> {
    store: &'a dyn Store,
    catalog: &'a ReferenceCatalog,
    options: PipelineOptions,
}

impl<'a> SeedPipeline<'a> {
    pub fn new(store: &'a dyn Store, catalog: &'a ReferenceCatalog, options: PipelineOptions) -> Self {
        Self {
            store,
            catalog,
            options,
        }
    }

    /// One full pass. Stages run strictly in `SEED_ORDER`; the first store
    /// error aborts the run and leaves earlier stages committed.
    pub async fn run(&self) -> Result<SeedRunSummary, SeedError> {
        validate_stage_order(&SEED_ORDER)?;
        self.catalog.validate()?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, backend = self.store.backend(), "seed run started");

        let reset = if self.options.reset {
            let span = info_span!("reset", %run_id);
            Some(reset_store(self.store).instrument(span).await?)
        } else {
            None
        };

        let mut trade_ids = IdMap::new();
        let mut region_ids = IdMap::new();
        let mut agency_ids = IdMap::new();
        let mut stages = Vec::with_capacity(SEED_ORDER.len());

        for stage in SEED_ORDER {
            let batch = self.options.batch_sizes.for_stage(stage);
            let span = info_span!("seed_stage", %run_id, stage = stage.name(), batch);
            let report = async {
                let report = match stage {
                    Stage::Trades => {
                        let seed = seed_trades(self.store, self.catalog, batch).await?;
                        let report = StageReport::from_entities(stage, &seed);
                        trade_ids = seed.ids;
                        report
                    }
                    Stage::Regions => {
                        let seed = seed_regions(self.store, self.catalog, batch).await?;
                        let report = StageReport::from_entities(stage, &seed);
                        region_ids = seed.ids;
                        report
                    }
                    Stage::Agencies => {
                        let seed = seed_agencies(self.store, self.catalog, batch).await?;
                        let report = StageReport::from_entities(stage, &seed);
                        agency_ids = seed.ids;
                        report
                    }
                    Stage::Compliance => StageReport::from_links(
                        stage,
                        seed_compliance(self.store, self.catalog, &agency_ids, batch).await?,
                    ),
                    Stage::AgencyTrades => StageReport::from_links(
                        stage,
                        link_agency_trades(self.store, self.catalog, &agency_ids, &trade_ids, batch)
                            .await?,
                    ),
                    Stage::AgencyRegions => StageReport::from_links(
                        stage,
                        link_agency_regions(
                            self.store,
                            self.catalog,
                            &agency_ids,
                            &region_ids,
                            batch,
                        )
                        .await?,
                    ),
                };
                info!(
                    created = report.created,
                    skipped = report.skipped,
                    unresolved = report.unresolved.len(),
                    "stage complete"
                );
                Ok::<_, SeedError>(report)
            }
            .instrument(span)
            .await?;
            stages.push(report);
        }

        if self.options.strict {
            if let Some(first) = stages.iter().flat_map(|s| s.unresolved.iter()).next() {
                warn!(%run_id, "strict run found unresolved references");
                return Err(SeedError::Resolution(first.clone()));
            }
        }

        let verification = if self.options.verify {
            Some(
                verify_store(self.store, self.catalog)
                    .instrument(info_span!("verify_after_seed", %run_id))
                    .await,
            )
        } else {
            None
        };

        let summary = SeedRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            backend: self.store.backend().to_string(),
            catalog_fingerprint: self.catalog.fingerprint()?,
            reset,
            stages,
            verification,
        };
        info!(
            %run_id,
            created = summary.total_created(),
            unresolved = summary.total_unresolved(),
            "seed run finished"
        );
        Ok(summary)
    }
}

/// Validate the catalog and config, connect, probe, and run the pipeline.
pub async fn run_seed(
    config: &SeedConfig,
    catalog: &ReferenceCatalog,
    options: PipelineOptions,
) -> Result<SeedRunSummary, SeedError> {
    catalog.validate()?;
    let store = connect_and_probe(config).await?;
    SeedPipeline::new(store.as_ref(), catalog, options).run().await
}

/// Connect, probe, and audit without mutating anything.
pub async fn run_verify(
    config: &SeedConfig,
    catalog: &ReferenceCatalog,
) -> Result<VerificationReport, SeedError> {
    catalog.validate()?;
    let store = connect_and_probe(config).await?;
    Ok(verify_store(store.as_ref(), catalog).await)
}
