//! Export projection and file writers (XLSX workbook, Parquet snapshot, manifest).

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, FixedOffset, Offset, Utc};
use parquet::arrow::ArrowWriter;
use rust_xlsxwriter::{Format, Workbook, XlsxError};
use serde::Serialize;
use sha2::{Digest, Sha256};
use smap_attribution::{group_by_entity, AttributionAnalyzer, IdentityFields};
use smap_client::{ClientConfig, HistoryCollector, PageFetcher, PageSource};
use smap_core::{AttributionSummary, EntityKind, FieldNames, HistoryRecord, UtmField, UtmTouch};
use thiserror::Error;
use tokio::fs;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "smap-export";

pub const ATTRIBUTION_HEADERS: [&str; 8] = [
    "Entity ID",
    "Name",
    "Email",
    "Deal Created",
    "UTM History",
    "Conversion Days",
    "First UTM",
    "Pre-Deal UTM",
];

pub const FALLBACK_HEADERS: [&str; 4] = ["Entity ID", "Name", "Email", "Note"];

pub const PARTIAL_DATA_NOTE: &str =
    "partial data only: no UTM history was recorded for any entity";

#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub export_dir: PathBuf,
    pub field_names_path: Option<PathBuf>,
    pub display_offset: FixedOffset,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            export_dir: PathBuf::from("./exports"),
            field_names_path: None,
            display_offset: kst(),
        }
    }
}

impl ExportConfig {
    pub fn from_env() -> Self {
        let offset_hours: i32 = std::env::var("SMAP_DISPLAY_UTC_OFFSET_HOURS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(9);
        Self {
            export_dir: std::env::var("SMAP_EXPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./exports")),
            field_names_path: std::env::var("SMAP_FIELD_NAMES").ok().map(PathBuf::from),
            display_offset: display_offset(offset_hours),
        }
    }

    pub fn load_field_names(&self) -> Result<FieldNames> {
        let Some(path) = &self.field_names_path else {
            return Ok(FieldNames::default());
        };
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        FieldNames::from_yaml_str(&yaml).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Whole-hour offset east of UTC; out-of-range values fall back to +9.
pub fn display_offset(hours: i32) -> FixedOffset {
    hours
        .checked_mul(3600)
        .and_then(FixedOffset::east_opt)
        .unwrap_or_else(kst)
}

fn kst() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).unwrap_or(Utc.fix())
}

/// Text rendering shared by the export and the web UI.
#[derive(Debug, Clone, Copy)]
pub struct DisplayFormat {
    pub offset: FixedOffset,
}

impl Default for DisplayFormat {
    fn default() -> Self {
        Self { offset: kst() }
    }
}

impl DisplayFormat {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    pub fn time(&self, ts: DateTime<Utc>) -> String {
        ts.with_timezone(&self.offset).format("%Y-%m-%d %H:%M").to_string()
    }

    pub fn touch_summary(&self, touch: &UtmTouch) -> String {
        UtmField::ALL
            .into_iter()
            .map(|field| touch.get(field).unwrap_or("-"))
            .collect::<Vec<_>>()
            .join(" / ")
    }

    pub fn touch_line(&self, touch: &UtmTouch) -> String {
        format!("{} | {}", self.time(touch.created_at), self.touch_summary(touch))
    }

    /// Touches are expected newest first, as the analyzer returns them.
    pub fn history_block(&self, touches: &[UtmTouch]) -> String {
        touches
            .iter()
            .map(|t| self.touch_line(t))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// One attribution row of the workbook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRow {
    pub entity_id: String,
    pub name: String,
    pub email: String,
    pub deal_created_at: String,
    pub utm_history: String,
    pub conversion_days: String,
    pub first_utm: String,
    pub pre_deal_utm: String,
}

impl ExportRow {
    pub fn cells(&self) -> [&str; 8] {
        [
            self.entity_id.as_str(),
            self.name.as_str(),
            self.email.as_str(),
            self.deal_created_at.as_str(),
            self.utm_history.as_str(),
            self.conversion_days.as_str(),
            self.first_utm.as_str(),
            self.pre_deal_utm.as_str(),
        ]
    }
}

/// Identity-only row used when nothing in the collection carries UTM data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackRow {
    pub entity_id: String,
    pub name: String,
    pub email: String,
    pub note: String,
}

impl FallbackRow {
    pub fn cells(&self) -> [&str; 4] {
        [
            self.entity_id.as_str(),
            self.name.as_str(),
            self.email.as_str(),
            self.note.as_str(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportSet {
    Attribution(Vec<ExportRow>),
    IdentityOnly(Vec<FallbackRow>),
}

impl ExportSet {
    pub fn len(&self) -> usize {
        match self {
            ExportSet::Attribution(rows) => rows.len(),
            ExportSet::IdentityOnly(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, ExportSet::IdentityOnly(_))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExportDataError {
    #[error("no exportable rows: the history collection is empty")]
    NoRows,
}

#[derive(Debug, Clone, Default)]
pub struct ExportProjector {
    analyzer: AttributionAnalyzer,
    format: DisplayFormat,
}

impl ExportProjector {
    pub fn new(analyzer: AttributionAnalyzer, format: DisplayFormat) -> Self {
        Self { analyzer, format }
    }

    pub fn analyzer(&self) -> &AttributionAnalyzer {
        &self.analyzer
    }

    pub fn format(&self) -> &DisplayFormat {
        &self.format
    }

    pub fn project(&self, entity_id: &str, identity: &IdentityFields, summary: &AttributionSummary) -> ExportRow {
        ExportRow {
            entity_id: entity_id.to_string(),
            name: identity.name.clone().unwrap_or_default(),
            email: identity.email.clone().unwrap_or_default(),
            deal_created_at: summary
                .deal_created_at
                .map(|ts| self.format.time(ts))
                .unwrap_or_default(),
            utm_history: self.format.history_block(&summary.utm_touches),
            conversion_days: summary
                .conversion_days
                .map(|d| d.to_string())
                .unwrap_or_default(),
            first_utm: summary
                .first_touch
                .as_ref()
                .map(|t| self.format.touch_summary(t))
                .unwrap_or_default(),
            pre_deal_utm: summary
                .pre_deal_touch
                .as_ref()
                .map(|t| self.format.touch_summary(t))
                .unwrap_or_default(),
        }
    }

    pub fn project_fallback(&self, entity_id: &str, identity: &IdentityFields) -> FallbackRow {
        FallbackRow {
            entity_id: entity_id.to_string(),
            name: identity.name.clone().unwrap_or_default(),
            email: identity.email.clone().unwrap_or_default(),
            note: PARTIAL_DATA_NOTE.to_string(),
        }
    }

    /// Entities without UTM records are filtered out before projection. When
    /// that leaves nothing, every entity is exported identity-only instead.
    pub fn build(&self, records: &[HistoryRecord]) -> Result<ExportSet, ExportDataError> {
        let grouped = group_by_entity(records);
        if grouped.is_empty() {
            return Err(ExportDataError::NoRows);
        }

        let rows = grouped
            .iter()
            .filter(|(_, entity_records)| self.analyzer.has_utm(entity_records))
            .map(|(entity_id, entity_records)| {
                let identity = self.analyzer.identity(entity_records);
                let summary = self.analyzer.analyze(entity_records);
                self.project(entity_id, &identity, &summary)
            })
            .collect::<Vec<_>>();
        if !rows.is_empty() {
            return Ok(ExportSet::Attribution(rows));
        }

        Ok(ExportSet::IdentityOnly(
            grouped
                .iter()
                .map(|(entity_id, entity_records)| {
                    self.project_fallback(entity_id, &self.analyzer.identity(entity_records))
                })
                .collect(),
        ))
    }
}

fn build_workbook(set: &ExportSet) -> Result<Workbook, XlsxError> {
    let mut workbook = Workbook::new();
    let header = Format::new().set_bold();
    let wrapped = Format::new().set_text_wrap();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name("Attribution")?;

    match set {
        ExportSet::Attribution(rows) => {
            for (col, title) in ATTRIBUTION_HEADERS.iter().enumerate() {
                worksheet.write_string_with_format(0, col as u16, *title, &header)?;
            }
            for (idx, row) in rows.iter().enumerate() {
                let r = idx as u32 + 1;
                for (col, cell) in row.cells().iter().enumerate() {
                    if col == 4 {
                        worksheet.write_string_with_format(r, col as u16, *cell, &wrapped)?;
                    } else {
                        worksheet.write_string(r, col as u16, *cell)?;
                    }
                }
            }
            worksheet.set_column_width(0, 28)?;
            worksheet.set_column_width(4, 60)?;
            worksheet.set_column_width(6, 36)?;
            worksheet.set_column_width(7, 36)?;
        }
        ExportSet::IdentityOnly(rows) => {
            for (col, title) in FALLBACK_HEADERS.iter().enumerate() {
                worksheet.write_string_with_format(0, col as u16, *title, &header)?;
            }
            for (idx, row) in rows.iter().enumerate() {
                let r = idx as u32 + 1;
                for (col, cell) in row.cells().iter().enumerate() {
                    worksheet.write_string(r, col as u16, *cell)?;
                }
            }
            worksheet.set_column_width(0, 28)?;
            worksheet.set_column_width(3, 60)?;
        }
    }

    Ok(workbook)
}

/// Workbook bytes for an HTTP download.
pub fn workbook_bytes(set: &ExportSet) -> Result<Vec<u8>> {
    let mut workbook = build_workbook(set).context("building export workbook")?;
    workbook.save_to_buffer().context("serializing export workbook")
}

pub fn write_workbook(path: &Path, set: &ExportSet) -> Result<()> {
    let mut workbook = build_workbook(set).context("building export workbook")?;
    workbook
        .save(path)
        .with_context(|| format!("writing {}", path.display()))
}

pub fn write_parquet_snapshot(path: &Path, set: &ExportSet) -> Result<()> {
    let batch = match set {
        ExportSet::Attribution(rows) => {
            let names = [
                "entity_id",
                "name",
                "email",
                "deal_created_at",
                "utm_history",
                "conversion_days",
                "first_utm",
                "pre_deal_utm",
            ];
            let columns = (0..names.len())
                .map(|col| {
                    Arc::new(StringArray::from(
                        rows.iter().map(|r| Some(r.cells()[col])).collect::<Vec<_>>(),
                    )) as Arc<dyn arrow_array::Array>
                })
                .collect::<Vec<_>>();
            string_batch(&names, columns)?
        }
        ExportSet::IdentityOnly(rows) => {
            let names = ["entity_id", "name", "email", "note"];
            let columns = (0..names.len())
                .map(|col| {
                    Arc::new(StringArray::from(
                        rows.iter().map(|r| Some(r.cells()[col])).collect::<Vec<_>>(),
                    )) as Arc<dyn arrow_array::Array>
                })
                .collect::<Vec<_>>();
            string_batch(&names, columns)?
        }
    };

    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn string_batch(names: &[&str], columns: Vec<Arc<dyn arrow_array::Array>>) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(
        names
            .iter()
            .map(|n| ArrowField::new(*n, DataType::Utf8, false))
            .collect::<Vec<_>>(),
    ));
    RecordBatch::try_new(schema, columns).context("building export record batch")
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub kind: EntityKind,
    pub partial: bool,
    pub files: Vec<ExportManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<ExportManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(run_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ExportManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportRunSummary {
    pub run_id: Uuid,
    pub kind: EntityKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages: usize,
    pub records: usize,
    pub rows: usize,
    pub partial: bool,
    pub run_dir: String,
    pub manifest: String,
}

pub struct ExportPipeline {
    client: ClientConfig,
    config: ExportConfig,
    source: Arc<dyn PageSource>,
    projector: ExportProjector,
}

impl ExportPipeline {
    pub fn new(client: ClientConfig, config: ExportConfig) -> Result<Self> {
        let source: Arc<dyn PageSource> = Arc::new(PageFetcher::new(&client)?);
        let fields = config.load_field_names()?;
        let projector = ExportProjector::new(
            AttributionAnalyzer::new(fields),
            DisplayFormat::new(config.display_offset),
        );
        Ok(Self {
            client,
            config,
            source,
            projector,
        })
    }

    pub fn with_source(mut self, source: Arc<dyn PageSource>) -> Self {
        self.source = source;
        self
    }

    pub async fn run_once(
        &self,
        kind: EntityKind,
        token: &str,
        cursor: Option<&str>,
    ) -> Result<ExportRunSummary> {
        let started_at = Utc::now();
        let collector =
            HistoryCollector::with_fresh_limiter(self.source.clone(), self.client.rate_limit);
        let collected = collector.collect(kind, token, cursor).await;
        let set = self.projector.build(&collected.records)?;

        let run_dir = self.config.export_dir.join(collected.run_id.to_string());
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;

        let xlsx_path = run_dir.join(format!("{kind}_attribution.xlsx"));
        let parquet_path = run_dir.join(format!("{kind}_attribution.parquet"));
        write_workbook(&xlsx_path, &set)?;
        write_parquet_snapshot(&parquet_path, &set)?;

        let manifest = ExportManifest {
            schema_version: 1,
            run_id: collected.run_id,
            kind,
            partial: set.is_partial(),
            files: vec![
                manifest_entry("workbook", &run_dir, &xlsx_path)?,
                manifest_entry("snapshot", &run_dir, &parquet_path)?,
            ],
        };
        let manifest_path = run_dir.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
        fs::write(&manifest_path, bytes)
            .await
            .with_context(|| format!("writing {}", manifest_path.display()))?;

        info!(
            run_id = %collected.run_id,
            kind = kind.as_str(),
            rows = set.len(),
            partial = set.is_partial(),
            "export written"
        );

        Ok(ExportRunSummary {
            run_id: collected.run_id,
            kind,
            started_at,
            finished_at: Utc::now(),
            pages: collected.pages,
            records: collected.records.len(),
            rows: set.len(),
            partial: set.is_partial(),
            run_dir: run_dir.display().to_string(),
            manifest: manifest_path.display().to_string(),
        })
    }
}

pub async fn run_export_from_env(
    kind: EntityKind,
    token: &str,
    cursor: Option<&str>,
) -> Result<ExportRunSummary> {
    let pipeline = ExportPipeline::new(ClientConfig::from_env(), ExportConfig::from_env())?;
    pipeline.run_once(kind, token, cursor).await
}
