//! Crawl orchestration, batch extraction and dataset export.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use arrow_array::{ArrayRef, BooleanArray, Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::NaiveDate;
use hoopstat_adapters::{box_score_links, extract_game, schedule_page_links, SchemaRegistry};
use hoopstat_core::{
    CanonicalSchema, Cell, ColumnKind, CrawlResource, FetchOutcome, GameRecord, ResourceKind,
    SchemaMode,
};
use hoopstat_storage::{ArtifactStore, Fetcher, HttpClientConfig, HttpRenderer, RetryPolicy};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hoopstat-sync";

pub const CONFIG_FILE: &str = "hoopstat.yaml";
pub const DATASET_CSV: &str = "nba_games.csv";
pub const DATASET_PARQUET: &str = "nba_games.parquet";
pub const DATASET_MANIFEST: &str = "manifest.json";

/// Target value for a team's last known game.
pub const NO_NEXT_GAME: u8 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    pub base_url: String,
    pub seasons: Vec<u16>,
    pub fetch_attempts: u32,
    pub fetch_delay_secs: u64,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub schema_mode: SchemaMode,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            output_dir: PathBuf::from("./dataset"),
            base_url: "https://www.basketball-reference.com".to_string(),
            seasons: (2016..=2024).collect(),
            fetch_attempts: 12,
            fetch_delay_secs: 9,
            http_timeout_secs: 30,
            user_agent: "hoopstat/0.1".to_string(),
            schema_mode: SchemaMode::Strict,
        }
    }
}

impl CrawlConfig {
    /// Defaults, then `hoopstat.yaml` from the working directory when present,
    /// then `HOOPSTAT_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let path = PathBuf::from(CONFIG_FILE);
        let file = path.exists().then_some(path.as_path());
        Self::load(file, |key| std::env::var(key).ok())
    }

    pub fn load(file: Option<&Path>, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match file {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(env)?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = env("HOOPSTAT_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(seasons) = env("HOOPSTAT_SEASONS") {
            self.seasons = parse_seasons(&seasons).context("HOOPSTAT_SEASONS")?;
        }
        if let Some(url) = env("HOOPSTAT_BASE_URL") {
            self.base_url = url;
        }
        if let Some(v) = env("HOOPSTAT_FETCH_ATTEMPTS") {
            self.fetch_attempts = parse_number(&v, "HOOPSTAT_FETCH_ATTEMPTS")?;
        }
        if let Some(v) = env("HOOPSTAT_FETCH_DELAY_SECS") {
            self.fetch_delay_secs = parse_number(&v, "HOOPSTAT_FETCH_DELAY_SECS")?;
        }
        if let Some(v) = env("HOOPSTAT_HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = parse_number(&v, "HOOPSTAT_HTTP_TIMEOUT_SECS")?;
        }
        if let Some(agent) = env("HOOPSTAT_USER_AGENT") {
            self.user_agent = agent;
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.fetch_attempts,
            base_delay: Duration::from_secs(self.fetch_delay_secs),
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn artifact_store(&self) -> ArtifactStore {
        ArtifactStore::new(self.data_dir.clone())
    }
}

fn parse_number<T: std::str::FromStr>(raw: &str, name: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("{name} must be a non-negative integer, got {raw:?}"))
}

/// Parse `2016-2024`, `2019,2021` or a mix of both into sorted, distinct
/// seasons.
pub fn parse_seasons(raw: &str) -> Result<Vec<u16>> {
    let mut seasons = BTreeSet::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                let start: u16 = parse_number(start, "season")?;
                let end: u16 = parse_number(end, "season")?;
                if start > end {
                    bail!("season range {part} runs backwards");
                }
                seasons.extend(start..=end);
            }
            None => {
                seasons.insert(parse_number(part, "season")?);
            }
        }
    }
    if seasons.is_empty() {
        bail!("no seasons in {raw:?}");
    }
    Ok(seasons.into_iter().collect())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CrawlSummary {
    pub run_id: Uuid,
    pub seasons: Vec<u16>,
    pub season_failures: usize,
    pub schedule_fetched: usize,
    pub schedule_cached: usize,
    pub schedule_failed: usize,
    pub boxscores_fetched: usize,
    pub boxscores_cached: usize,
    pub boxscores_failed: usize,
    pub fetch_calls: usize,
}

impl CrawlSummary {
    fn start(seasons: &[u16]) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            seasons: seasons.to_vec(),
            ..Self::default()
        }
    }
}

/// Walks season index -> schedule pages -> box scores, one fetch at a time.
/// Anything already in the store is read back instead of fetched; a failed
/// branch is logged and abandoned without stopping its siblings.
pub struct Orchestrator {
    base_url: String,
    fetcher: Fetcher,
    store: ArtifactStore,
}

impl Orchestrator {
    pub fn new(base_url: impl Into<String>, fetcher: Fetcher, store: ArtifactStore) -> Self {
        Self {
            base_url: base_url.into(),
            fetcher,
            store,
        }
    }

    pub fn from_config(config: &CrawlConfig) -> Result<Self> {
        let renderer = HttpRenderer::new(config.http_config())?;
        let fetcher = Fetcher::new(Arc::new(renderer), config.retry_policy());
        Ok(Self::new(config.base_url.clone(), fetcher, config.artifact_store()))
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub async fn run(&self, seasons: &[u16]) -> Result<CrawlSummary> {
        let mut summary = CrawlSummary::start(seasons);
        let run_id = summary.run_id;
        for &season in seasons {
            let span = info_span!("season", %run_id, season);
            self.crawl_season(season, &mut summary).instrument(span).await?;
        }
        info!(%run_id, ?summary, "crawl finished");
        Ok(summary)
    }

    /// Resume from stored schedule pages only; season indexes are not
    /// consulted. With every box score present this issues no fetches.
    pub async fn crawl_stored(&self, seasons: &[u16]) -> Result<CrawlSummary> {
        let mut summary = CrawlSummary::start(seasons);
        let run_id = summary.run_id;
        let stored = self.store.list(ResourceKind::SchedulePage).await?;
        for &season in seasons {
            let span = info_span!("season", %run_id, season, offline = true);
            self.crawl_stored_season(season, &stored, &mut summary)
                .instrument(span)
                .await?;
        }
        info!(%run_id, ?summary, "offline crawl finished");
        Ok(summary)
    }

    async fn crawl_season(&self, season: u16, summary: &mut CrawlSummary) -> Result<()> {
        let index = CrawlResource::season_index(&self.base_url, season)
            .with_context(|| format!("building season index for {season}"))?;
        let Some(markup) = self.fetch_fragment(&index, summary).await else {
            summary.season_failures += 1;
            warn!(id = %index.id, "abandoning season, index unavailable");
            return Ok(());
        };

        let pages = schedule_page_links(&self.base_url, &markup)
            .with_context(|| format!("reading links from {}", index.id))?;
        info!(pages = pages.len(), "discovered schedule pages");

        let mut schedules = Vec::with_capacity(pages.len());
        for page in &pages {
            if let Some(markup) = self.ensure_schedule_page(page, summary).await? {
                schedules.push((page.id.as_str(), markup));
            }
        }
        for (id, markup) in &schedules {
            self.crawl_box_scores(id, markup, summary).await?;
        }
        Ok(())
    }

    async fn crawl_stored_season(
        &self,
        season: u16,
        stored: &[String],
        summary: &mut CrawlSummary,
    ) -> Result<()> {
        let tag = season.to_string();
        for id in stored.iter().filter(|id| id.contains(&tag)) {
            let markup = self.store.read(ResourceKind::SchedulePage, id).await?;
            summary.schedule_cached += 1;
            self.crawl_box_scores(id, &markup, summary).await?;
        }
        Ok(())
    }

    async fn ensure_schedule_page(
        &self,
        page: &CrawlResource,
        summary: &mut CrawlSummary,
    ) -> Result<Option<String>> {
        if self.store.exists(page.kind, &page.id).await? {
            info!(id = %page.id, "schedule page already stored");
            summary.schedule_cached += 1;
            return self.store.read(page.kind, &page.id).await.map(Some);
        }
        match self.fetch_fragment(page, summary).await {
            Some(markup) => {
                self.persist(page, &markup).await?;
                summary.schedule_fetched += 1;
                Ok(Some(markup))
            }
            None => {
                summary.schedule_failed += 1;
                warn!(id = %page.id, "abandoning schedule page, fetch failed");
                Ok(None)
            }
        }
    }

    async fn crawl_box_scores(
        &self,
        schedule_id: &str,
        schedule_markup: &str,
        summary: &mut CrawlSummary,
    ) -> Result<()> {
        let links = box_score_links(&self.base_url, schedule_markup)
            .with_context(|| format!("reading links from {schedule_id}"))?;
        debug!(schedule = %schedule_id, links = links.len(), "box score links");
        for link in &links {
            if self.store.exists(link.kind, &link.id).await? {
                info!(id = %link.id, "box score already stored");
                summary.boxscores_cached += 1;
                continue;
            }
            match self.fetch_fragment(link, summary).await {
                Some(markup) => {
                    self.persist(link, &markup).await?;
                    summary.boxscores_fetched += 1;
                }
                None => {
                    summary.boxscores_failed += 1;
                    warn!(id = %link.id, schedule = %schedule_id, "skipping box score, fetch failed");
                }
            }
        }
        Ok(())
    }

    async fn persist(&self, resource: &CrawlResource, markup: &str) -> Result<()> {
        let stored = self.store.write(resource.kind, &resource.id, markup).await?;
        if stored.deduplicated {
            warn!(id = %resource.id, "artifact appeared while fetching, kept existing copy");
        } else {
            debug!(
                id = %resource.id,
                bytes = stored.byte_size,
                path = %stored.absolute_path.display(),
                "stored artifact"
            );
        }
        Ok(())
    }

    async fn fetch_fragment(
        &self,
        resource: &CrawlResource,
        summary: &mut CrawlSummary,
    ) -> Option<String> {
        summary.fetch_calls += 1;
        let span = info_span!("fetch", id = %resource.id, kind = %resource.kind);
        match self.fetcher.fetch(resource).instrument(span).await {
            Ok(FetchOutcome::Fragment(markup)) => Some(markup),
            Ok(FetchOutcome::Exhausted { attempts }) => {
                warn!(id = %resource.id, attempts, "giving up on resource");
                None
            }
            Err(err) => {
                warn!(id = %resource.id, error = %err, "fetch failed");
                None
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedDocument {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct ExtractionReport {
    pub records: Vec<GameRecord>,
    pub skipped: Vec<SkippedDocument>,
}

/// Extract every stored box score in id order. A document that fails is
/// logged and listed in the report; the rest of the batch continues.
pub async fn extract_batch(
    store: &ArtifactStore,
    registry: &mut SchemaRegistry,
) -> Result<ExtractionReport> {
    let ids: Vec<String> = store
        .list(ResourceKind::BoxScore)
        .await?
        .into_iter()
        .filter(|id| id.ends_with(".html"))
        .collect();

    let mut report = ExtractionReport::default();
    for (i, id) in ids.iter().enumerate() {
        let markup = match store.read(ResourceKind::BoxScore, id).await {
            Ok(markup) => markup,
            Err(err) => {
                let reason = format!("{err:#}");
                warn!(id = %id, error = %reason, "skipping unreadable box score");
                report.skipped.push(SkippedDocument { id: id.clone(), reason });
                continue;
            }
        };
        match extract_game(id, &markup, registry) {
            Ok((away, home)) => {
                report.records.push(away);
                report.records.push(home);
            }
            Err(err) => {
                warn!(id = %id, error = %err, "skipping box score");
                report.skipped.push(SkippedDocument {
                    id: id.clone(),
                    reason: err.to_string(),
                });
            }
        }
        if (i + 1) % 100 == 0 {
            info!(processed = i + 1, total = ids.len(), "extracting box scores");
        }
    }
    info!(
        records = report.records.len(),
        skipped = report.skipped.len(),
        "extraction finished"
    );
    Ok(report)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetManifest {
    pub schema_version: u32,
    pub rows: usize,
    pub schema_fingerprint: String,
    pub columns: Vec<String>,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// sha256 over the ordered canonical keys, one per line.
pub fn schema_fingerprint(schema: &CanonicalSchema) -> String {
    let mut hasher = Sha256::new();
    for key in schema.keys() {
        hasher.update(key.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Write the CSV and Parquet datasets plus `manifest.json` into `out_dir`.
/// Every record must have been projected onto `schema`.
pub async fn export_dataset(
    out_dir: &Path,
    schema: &CanonicalSchema,
    records: &[GameRecord],
) -> Result<DatasetManifest> {
    if let Some(stray) = records
        .iter()
        .find(|r| r.own.summary.schema() != schema || r.opp.summary.schema() != schema)
    {
        bail!(
            "record for {} on {} was projected onto a different schema",
            stray.team(),
            stray.date
        );
    }

    fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("creating {}", out_dir.display()))?;

    let csv_path = out_dir.join(DATASET_CSV);
    let parquet_path = out_dir.join(DATASET_PARQUET);
    write_csv(&csv_path, schema, records)?;
    write_dataset_parquet(&parquet_path, schema, records)?;

    let manifest = DatasetManifest {
        schema_version: 1,
        rows: records.len(),
        schema_fingerprint: schema_fingerprint(schema),
        columns: GameRecord::column_names(schema),
        files: vec![
            manifest_entry("games_csv", out_dir, &csv_path)?,
            manifest_entry("games_parquet", out_dir, &parquet_path)?,
        ],
    };

    let manifest_path = out_dir.join(DATASET_MANIFEST);
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing dataset manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(rows = manifest.rows, dir = %out_dir.display(), "dataset exported");
    Ok(manifest)
}

fn write_csv(path: &Path, schema: &CanonicalSchema, records: &[GameRecord]) -> Result<()> {
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
    writer
        .write_record(GameRecord::column_names(schema))
        .with_context(|| format!("writing header to {}", path.display()))?;
    for record in records {
        writer
            .write_record(record.cells().iter().map(ToString::to_string))
            .with_context(|| format!("writing {} {} to {}", record.team(), record.date, path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("flushing {}", path.display()))?;
    Ok(())
}

fn column_values<T>(rows: &[Vec<Cell>], index: usize, pick: impl Fn(&Cell) -> Option<T>) -> Vec<Option<T>> {
    rows.iter()
        .map(|row| row.get(index).and_then(&pick))
        .collect()
}

fn write_dataset_parquet(path: &Path, schema: &CanonicalSchema, records: &[GameRecord]) -> Result<()> {
    let rows: Vec<Vec<Cell>> = records.iter().map(GameRecord::cells).collect();
    let columns = GameRecord::columns(schema);

    let mut fields = Vec::with_capacity(columns.len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(columns.len());
    for (i, (name, kind)) in columns.iter().enumerate() {
        let (data_type, nullable, array): (DataType, bool, ArrayRef) = match kind {
            ColumnKind::Number => (
                DataType::Float64,
                true,
                Arc::new(Float64Array::from(column_values(&rows, i, |c| match c {
                    Cell::Number(v) => *v,
                    _ => None,
                }))),
            ),
            ColumnKind::Text => (
                DataType::Utf8,
                false,
                Arc::new(StringArray::from(column_values(&rows, i, |c| match c {
                    Cell::Text(s) => Some(s.clone()),
                    _ => None,
                }))),
            ),
            ColumnKind::Count => (
                DataType::UInt32,
                false,
                Arc::new(UInt32Array::from(column_values(&rows, i, |c| match c {
                    Cell::Count(n) => Some(*n),
                    _ => None,
                }))),
            ),
            ColumnKind::Flag => (
                DataType::Boolean,
                false,
                Arc::new(BooleanArray::from(column_values(&rows, i, |c| match c {
                    Cell::Flag(b) => Some(*b),
                    _ => None,
                }))),
            ),
            ColumnKind::Date => (
                DataType::Utf8,
                false,
                Arc::new(StringArray::from(column_values(&rows, i, |c| match c {
                    Cell::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
                    _ => None,
                }))),
            ),
        };
        fields.push(ArrowField::new(name, data_type, nullable));
        arrays.push(array);
    }

    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
        .context("building games record batch")?;
    write_parquet(path, batch)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = std::fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
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

fn manifest_entry(name: &str, out_dir: &Path, path: &Path) -> Result<ManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(out_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

/// Identity and outcome of one dataset row, as the modeling stage keys it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GameKey {
    pub team: String,
    pub season: u16,
    pub date: NaiveDate,
    #[serde(deserialize_with = "deserialize_flag")]
    pub won: bool,
}

impl From<&GameRecord> for GameKey {
    fn from(record: &GameRecord) -> Self {
        Self {
            team: record.own.team.clone(),
            season: record.season,
            date: record.date,
            won: record.won,
        }
    }
}

fn deserialize_flag<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    let raw = String::deserialize(deserializer)?;
    match raw.as_str() {
        "True" | "true" | "1" => Ok(true),
        "False" | "false" | "0" => Ok(false),
        other => Err(serde::de::Error::custom(format!("invalid flag {other:?}"))),
    }
}

/// Read the identity columns of an exported CSV dataset.
pub fn read_game_keys(path: &Path) -> Result<Vec<GameKey>> {
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
    reader
        .deserialize::<GameKey>()
        .enumerate()
        .map(|(i, row)| row.with_context(|| format!("reading row {} of {}", i + 1, path.display())))
        .collect()
}

fn date_ordered(games: &[GameKey], indices: &mut [usize]) {
    indices.sort_by_key(|&i| games[i].date);
}

/// For each row, the outcome of the same team's next game by date: 1 for a
/// win, 0 for a loss, [`NO_NEXT_GAME`] for the team's last game. Aligned with
/// `games`.
pub fn add_next_game_target(games: &[GameKey]) -> Vec<u8> {
    let mut by_team: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, game) in games.iter().enumerate() {
        by_team.entry(game.team.as_str()).or_default().push(i);
    }

    let mut targets = vec![NO_NEXT_GAME; games.len()];
    for indices in by_team.values_mut() {
        date_ordered(games, indices);
        for pair in indices.windows(2) {
            targets[pair[0]] = u8::from(games[pair[1]].won);
        }
    }
    targets
}

/// Row indices per (team, season), each list in date order.
pub fn group_by_team_season(games: &[GameKey]) -> BTreeMap<(String, u16), Vec<usize>> {
    let mut groups: BTreeMap<(String, u16), Vec<usize>> = BTreeMap::new();
    for (i, game) in games.iter().enumerate() {
        groups.entry((game.team.clone(), game.season)).or_default().push(i);
    }
    for indices in groups.values_mut() {
        date_ordered(games, indices);
    }
    groups
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalkForwardSplit {
    pub train_seasons: Vec<u16>,
    pub test_season: u16,
}

impl WalkForwardSplit {
    /// Indices of `row_seasons` in the train and test partitions.
    pub fn partition(&self, row_seasons: &[u16]) -> (Vec<usize>, Vec<usize>) {
        let mut train = Vec::new();
        let mut test = Vec::new();
        for (i, &season) in row_seasons.iter().enumerate() {
            if season < self.test_season {
                train.push(i);
            } else if season == self.test_season {
                test.push(i);
            }
        }
        (train, test)
    }
}

/// One split per distinct season from position `start` on: test on that
/// season, train on every earlier one.
pub fn walk_forward_splits(seasons: &[u16], start: usize) -> Vec<WalkForwardSplit> {
    let ordered: Vec<u16> = seasons
        .iter()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    ordered
        .iter()
        .enumerate()
        .skip(start)
        .map(|(i, &test_season)| WalkForwardSplit {
            train_seasons: ordered[..i].to_vec(),
            test_season,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SplitSizes {
    pub test_season: u16,
    pub train_seasons: Vec<u16>,
    pub train_rows: usize,
    pub test_rows: usize,
    pub test_wins_next: usize,
    pub test_losses_next: usize,
}

pub fn split_sizes(games: &[GameKey], start: usize) -> Vec<SplitSizes> {
    let row_seasons: Vec<u16> = games.iter().map(|g| g.season).collect();
    let targets = add_next_game_target(games);
    walk_forward_splits(&row_seasons, start)
        .into_iter()
        .map(|split| {
            let (train, test) = split.partition(&row_seasons);
            let count = |want: u8| test.iter().filter(|&&i| targets[i] == want).count();
            SplitSizes {
                test_wins_next: count(1),
                test_losses_next: count(0),
                test_season: split.test_season,
                train_seasons: split.train_seasons,
                train_rows: train.len(),
                test_rows: test.len(),
            }
        })
        .collect()
}

/// Numeric model inputs for one record: stat values, total and home flag of
/// both sides. Identity, season, date and outcome are left out.
pub fn feature_row(record: &GameRecord) -> Vec<Option<f64>> {
    let mut row = Vec::new();
    for side in [&record.own, &record.opp] {
        row.extend_from_slice(side.summary.values());
        row.push(Some(f64::from(side.total)));
        row.push(Some(if side.home { 1.0 } else { 0.0 }));
    }
    row
}

/// Per-column min-max scaling to [0, 1]. Fit on the training partition only.
#[derive(Debug, Clone, PartialEq)]
pub struct MinMaxScaler {
    ranges: Vec<Option<(f64, f64)>>,
}

impl MinMaxScaler {
    pub fn fit(rows: &[Vec<Option<f64>>]) -> Self {
        let width = rows.iter().map(Vec::len).max().unwrap_or(0);
        let mut ranges: Vec<Option<(f64, f64)>> = vec![None; width];
        for row in rows {
            for (range, value) in ranges.iter_mut().zip(row) {
                if let Some(v) = *value {
                    *range = Some(match *range {
                        Some((lo, hi)) => (lo.min(v), hi.max(v)),
                        None => (v, v),
                    });
                }
            }
        }
        Self { ranges }
    }

    /// Empty cells stay empty; constant columns map to 0.
    pub fn transform(&self, rows: &[Vec<Option<f64>>]) -> Vec<Vec<Option<f64>>> {
        rows.iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .map(|(i, value)| {
                        let v = (*value)?;
                        let (lo, hi) = self.ranges.get(i).copied().flatten()?;
                        Some(if hi > lo { (v - lo) / (hi - lo) } else { 0.0 })
                    })
                    .collect()
            })
            .collect()
    }
}

/// Feature matrices for one walk-forward split, scaled by a [`MinMaxScaler`]
/// fit on the training rows only.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaledSplit {
    pub split: WalkForwardSplit,
    pub train: Vec<Vec<Option<f64>>>,
    pub train_targets: Vec<u8>,
    pub test: Vec<Vec<Option<f64>>>,
    pub test_targets: Vec<u8>,
}

pub fn scaled_splits(records: &[GameRecord], start: usize) -> Vec<ScaledSplit> {
    let keys: Vec<GameKey> = records.iter().map(GameKey::from).collect();
    let targets = add_next_game_target(&keys);
    let row_seasons: Vec<u16> = keys.iter().map(|k| k.season).collect();
    let features: Vec<Vec<Option<f64>>> = records.iter().map(feature_row).collect();
    let rows = |indices: &[usize]| -> Vec<Vec<Option<f64>>> {
        indices.iter().map(|&i| features[i].clone()).collect()
    };
    let outcomes = |indices: &[usize]| -> Vec<u8> { indices.iter().map(|&i| targets[i]).collect() };

    walk_forward_splits(&row_seasons, start)
        .into_iter()
        .map(|split| {
            let (train_idx, test_idx) = split.partition(&row_seasons);
            let train = rows(&train_idx);
            let scaler = MinMaxScaler::fit(&train);
            ScaledSplit {
                train: scaler.transform(&train),
                train_targets: outcomes(&train_idx),
                test: scaler.transform(&rows(&test_idx)),
                test_targets: outcomes(&test_idx),
                split,
            }
        })
        .collect()
}

pub async fn run_crawl(config: &CrawlConfig, offline: bool) -> Result<CrawlSummary> {
    let orchestrator = Orchestrator::from_config(config)?;
    if offline {
        orchestrator.crawl_stored(&config.seasons).await
    } else {
        orchestrator.run(&config.seasons).await
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractSummary {
    pub records: usize,
    pub skipped: Vec<SkippedDocument>,
    pub manifest: Option<DatasetManifest>,
}

/// Extract the stored box scores and export the dataset into
/// `config.output_dir`. Nothing is exported when no document parsed.
pub async fn run_extract(config: &CrawlConfig) -> Result<ExtractSummary> {
    let store = config.artifact_store();
    let mut registry = SchemaRegistry::first_document_wins(config.schema_mode);
    let report = extract_batch(&store, &mut registry).await?;

    let manifest = match registry.schema() {
        Some(schema) => Some(export_dataset(&config.output_dir, schema, &report.records).await?),
        None => {
            warn!(dir = %store.root().display(), "no box score parsed, nothing exported");
            None
        }
    };
    Ok(ExtractSummary {
        records: report.records.len(),
        skipped: report.skipped,
        manifest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hoopstat_core::{StatLine, TeamLine};
    use std::collections::HashMap;

    fn key(team: &str, season: u16, date: &str, won: bool) -> GameKey {
        GameKey {
            team: team.to_string(),
            season,
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            won,
        }
    }

    #[test]
    fn seasons_parse_from_ranges_and_lists() {
        assert_eq!(parse_seasons("2016-2018").unwrap(), vec![2016, 2017, 2018]);
        assert_eq!(parse_seasons("2021, 2019,2021").unwrap(), vec![2019, 2021]);
        assert_eq!(parse_seasons("2016-2017,2020").unwrap(), vec![2016, 2017, 2020]);
        assert!(parse_seasons("2020-2018").is_err());
        assert!(parse_seasons("twenty").is_err());
        assert!(parse_seasons(" , ").is_err());
    }

    #[test]
    fn env_overrides_yaml_which_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            "data_dir: /srv/hoopstat\nseasons: [2020, 2021]\nfetch_delay_secs: 3\nschema_mode: reindex\n",
        )
        .unwrap();

        let env: HashMap<&str, &str> = HashMap::from([
            ("HOOPSTAT_SEASONS", "2022-2023"),
            ("HOOPSTAT_FETCH_ATTEMPTS", "4"),
        ]);
        let config = CrawlConfig::load(Some(path.as_path()), |k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/srv/hoopstat"));
        assert_eq!(config.seasons, vec![2022, 2023]);
        assert_eq!(config.fetch_attempts, 4);
        assert_eq!(config.fetch_delay_secs, 3);
        assert_eq!(config.http_timeout_secs, 30);
        assert_eq!(config.schema_mode, SchemaMode::Reindex);
        assert_eq!(
            config.retry_policy(),
            RetryPolicy {
                max_attempts: 4,
                base_delay: Duration::from_secs(3)
            }
        );
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = CrawlConfig::load(None, |_| None).unwrap();
        assert_eq!(config.seasons.first(), Some(&2016));
        assert_eq!(config.seasons.last(), Some(&2024));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.schema_mode, SchemaMode::Strict);
        assert!(CrawlConfig::load(None, |k| (k == "HOOPSTAT_FETCH_ATTEMPTS").then(|| "many".to_string())).is_err());
    }

    #[test]
    fn target_is_next_game_of_same_team() {
        let games = vec![
            key("BOS", 2023, "2023-01-03", true),
            key("LAL", 2023, "2023-01-01", false),
            key("BOS", 2023, "2023-01-01", false),
            key("LAL", 2023, "2023-01-05", true),
            key("BOS", 2023, "2023-01-07", false),
        ];
        assert_eq!(add_next_game_target(&games), vec![0, 1, 1, NO_NEXT_GAME, NO_NEXT_GAME]);
    }

    #[test]
    fn groups_are_per_team_season_in_date_order() {
        let games = vec![
            key("BOS", 2023, "2023-01-03", true),
            key("BOS", 2022, "2022-04-01", true),
            key("BOS", 2023, "2022-12-30", false),
        ];
        let groups = group_by_team_season(&games);
        assert_eq!(groups[&("BOS".to_string(), 2023)], vec![2, 0]);
        assert_eq!(groups[&("BOS".to_string(), 2022)], vec![1]);
    }

    #[test]
    fn walk_forward_never_trains_on_the_test_season_or_later() {
        let splits = walk_forward_splits(&[2019, 2017, 2018, 2020, 2018], 2);
        assert_eq!(
            splits,
            vec![
                WalkForwardSplit {
                    train_seasons: vec![2017, 2018],
                    test_season: 2019
                },
                WalkForwardSplit {
                    train_seasons: vec![2017, 2018, 2019],
                    test_season: 2020
                },
            ]
        );
        let (train, test) = splits[0].partition(&[2017, 2019, 2020, 2018]);
        assert_eq!(train, vec![0, 3]);
        assert_eq!(test, vec![1]);
        assert!(walk_forward_splits(&[2017, 2018], 2).is_empty());
    }

    #[test]
    fn split_sizes_count_rows_and_known_targets() {
        let games = vec![
            key("BOS", 2022, "2022-01-01", true),
            key("BOS", 2023, "2023-01-01", true),
            key("BOS", 2023, "2023-01-02", false),
        ];
        let sizes = split_sizes(&games, 1);
        assert_eq!(sizes.len(), 1);
        assert_eq!((sizes[0].train_rows, sizes[0].test_rows), (1, 2));
        assert_eq!((sizes[0].test_wins_next, sizes[0].test_losses_next), (0, 1));
    }

    fn game(season: u16, date: &str, lal_away: u32, bos_home: u32) -> (GameRecord, GameRecord) {
        let schema = CanonicalSchema::from_keys(vec!["pts".into()]).unwrap();
        let side = |team: &str, pts: u32, home: bool| TeamLine {
            team: team.to_string(),
            summary: schema
                .project(
                    &StatLine::from_entries(vec![("pts".into(), Some(f64::from(pts)))]),
                    SchemaMode::Strict,
                )
                .unwrap(),
            total: pts,
            home,
        };
        GameRecord::mirrored_pair(
            side("LAL", lal_away, false),
            side("BOS", bos_home, true),
            season,
            NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
        )
    }

    #[test]
    fn scaled_splits_fit_on_earlier_seasons_only() {
        let mut records = Vec::new();
        for (season, date, lal, bos) in [
            (2021, "2021-01-10", 90, 100),
            (2022, "2022-01-10", 120, 110),
            (2023, "2023-01-10", 95, 105),
        ] {
            let (away, home) = game(season, date, lal, bos);
            records.extend([away, home]);
        }

        let splits = scaled_splits(&records, 2);
        assert_eq!(splits.len(), 1);
        let split = &splits[0];
        assert_eq!(split.split.test_season, 2023);
        assert_eq!(split.split.train_seasons, vec![2021, 2022]);
        assert_eq!(split.train_targets, vec![1, 0, 0, 1]);
        assert_eq!(split.test_targets, vec![NO_NEXT_GAME, NO_NEXT_GAME]);

        // own pts, total, home, then the opponent's
        assert_eq!(feature_row(&records[5]), vec![Some(105.0), Some(105.0), Some(1.0), Some(95.0), Some(95.0), Some(0.0)]);
        assert_eq!(split.test[1][0], Some(0.5));
        assert_eq!(split.test[1][2], Some(1.0));
        assert!(split
            .train
            .iter()
            .flatten()
            .all(|v| v.is_some_and(|v| (0.0..=1.0).contains(&v))));
    }

    #[test]
    fn scaler_fits_on_train_and_handles_constant_and_empty_columns() {
        let train = vec![
            vec![Some(10.0), Some(5.0), None],
            vec![Some(20.0), Some(5.0), None],
        ];
        let scaler = MinMaxScaler::fit(&train);
        let scaled = scaler.transform(&[vec![Some(15.0), Some(5.0), Some(1.0)], vec![Some(30.0), None, None]]);
        assert_eq!(scaled[0], vec![Some(0.5), Some(0.0), None]);
        assert_eq!(scaled[1], vec![Some(2.0), None, None]);
    }
}
