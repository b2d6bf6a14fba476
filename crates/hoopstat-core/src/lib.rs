//! Core domain model for hoopstat: crawl resources, parsed stat tables and the
//! canonical game records handed to the modeling stage.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "hoopstat-core";

pub const SEASON_INDEX_SELECTOR: &str = "#content .filter";
pub const SCHEDULE_PAGE_SELECTOR: &str = "#all_schedule";
pub const BOX_SCORE_SELECTOR: &str = "#content";

/// Substring that marks a schedule-page href as a box-score link.
pub const BOX_SCORE_MARKER: &str = "boxscore";

/// Level of the crawl hierarchy a resource belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    SeasonIndex,
    SchedulePage,
    BoxScore,
}

impl ResourceKind {
    /// Artifact namespace for persisted kinds. Season indexes are discovery
    /// roots and are never persisted.
    pub fn namespace(self) -> Option<&'static str> {
        match self {
            Self::SeasonIndex => None,
            Self::SchedulePage => Some("standings"),
            Self::BoxScore => Some("scores"),
        }
    }

    pub fn selector(self) -> &'static str {
        match self {
            Self::SeasonIndex => SEASON_INDEX_SELECTOR,
            Self::SchedulePage => SCHEDULE_PAGE_SELECTOR,
            Self::BoxScore => BOX_SCORE_SELECTOR,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::SeasonIndex => "season-index",
            Self::SchedulePage => "schedule-page",
            Self::BoxScore => "box-score",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("url {0} has no usable terminal path segment")]
    NoResourceId(String),
    #[error("href is empty")]
    EmptyHref,
}

/// One addressable page in the crawl. `id` is the terminal path segment of the
/// URL and doubles as the artifact store key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CrawlResource {
    pub url: String,
    pub selector: String,
    pub kind: ResourceKind,
    pub id: String,
}

impl CrawlResource {
    pub fn new(kind: ResourceKind, url: impl Into<String>) -> Result<Self, ResourceError> {
        let url = url.into();
        let id = resource_id_from_url(&url).ok_or_else(|| ResourceError::NoResourceId(url.clone()))?;
        Ok(Self {
            selector: kind.selector().to_string(),
            url,
            kind,
            id,
        })
    }

    pub fn season_index(base_url: &str, season: u16) -> Result<Self, ResourceError> {
        let url = format!("{}/leagues/NBA_{season}_games.html", base_url.trim_end_matches('/'));
        Self::new(ResourceKind::SeasonIndex, url)
    }

    /// Build a resource from an href found in fetched markup, resolving
    /// site-relative paths against `base_url`.
    pub fn from_href(kind: ResourceKind, base_url: &str, href: &str) -> Result<Self, ResourceError> {
        Self::new(kind, join_href(base_url, href)?)
    }
}

pub fn join_href(base_url: &str, href: &str) -> Result<String, ResourceError> {
    let href = href.trim();
    if href.is_empty() {
        return Err(ResourceError::EmptyHref);
    }
    if href.starts_with("http://") || href.starts_with("https://") {
        return Ok(href.to_string());
    }
    let base = base_url.trim_end_matches('/');
    if href.starts_with('/') {
        Ok(format!("{base}{href}"))
    } else {
        Ok(format!("{base}/{href}"))
    }
}

/// Terminal path segment of `url`, ignoring any query string or fragment.
pub fn resource_id_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let path = path
        .split_once("://")
        .map(|(_, rest)| rest.split_once('/').map(|(_, p)| p).unwrap_or_default())
        .unwrap_or(path);
    let segment = path.rsplit('/').next()?.trim();
    if segment.is_empty() || segment == "." || segment == ".." {
        None
    } else {
        Some(segment.to_string())
    }
}

/// Result of one fetch. A fragment is either fully present or absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Fragment(String),
    Exhausted { attempts: u32 },
}

impl FetchOutcome {
    pub fn into_fragment(self) -> Option<String> {
        match self {
            Self::Fragment(markup) => Some(markup),
            Self::Exhausted { .. } => None,
        }
    }
}

/// One per-player row of a stat table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRow {
    pub name: String,
    pub values: Vec<Option<f64>>,
}

/// Numeric view of one team's stat table for one category. `totals` is the
/// trailing aggregate row; `players` never contains it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamStatTable {
    pub columns: Vec<String>,
    pub players: Vec<PlayerRow>,
    pub totals: Vec<Option<f64>>,
}

impl TeamStatTable {
    /// Column-wise maximum across player rows. Empty cells are skipped; a
    /// column with no numeric player cell yields `None`.
    pub fn column_max(&self, index: usize) -> Option<f64> {
        self.players
            .iter()
            .filter_map(|row| row.values.get(index).copied().flatten())
            .fold(None, |acc, v| Some(acc.map_or(v, |m: f64| m.max(v))))
    }
}

/// Raw, unprojected per-team summary: aggregate totals followed by `_max`
/// entries, in source order. May contain duplicate keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatLine {
    entries: Vec<(String, Option<f64>)>,
}

impl StatLine {
    pub fn from_tables(tables: &[&TeamStatTable]) -> Self {
        let mut entries = Vec::new();
        for table in tables {
            for (i, column) in table.columns.iter().enumerate() {
                entries.push((column.to_lowercase(), table.totals.get(i).copied().flatten()));
            }
        }
        for table in tables {
            for (i, column) in table.columns.iter().enumerate() {
                entries.push((format!("{}_max", column.to_lowercase()), table.column_max(i)));
            }
        }
        Self { entries }
    }

    pub fn from_entries(entries: Vec<(String, Option<f64>)>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[(String, Option<f64>)] {
        &self.entries
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// First value recorded under `key`.
    pub fn get(&self, key: &str) -> Option<Option<f64>> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| *v)
    }
}

/// Stat families whose columns come and go across seasons.
pub fn is_unstable_stat(key: &str) -> bool {
    key.contains("bpm")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaMode {
    /// Missing or extra keys fail the projection.
    #[default]
    Strict,
    /// Missing keys project to empty values, extra keys are dropped.
    Reindex,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("stat line has no usable keys")]
    Empty,
    #[error("stat keys do not match canonical schema (missing: {missing:?}, extra: {extra:?})")]
    Mismatch { missing: Vec<String>, extra: Vec<String> },
}

/// Ordered stat-key set every game summary is projected onto.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalSchema {
    keys: Arc<[String]>,
}

impl CanonicalSchema {
    /// Derive a schema from a stat line: duplicates keep their first
    /// occurrence and unstable families are dropped.
    pub fn from_stat_line(line: &StatLine) -> Result<Self, SchemaError> {
        let mut seen = HashSet::new();
        let keys: Vec<String> = line
            .keys()
            .filter(|k| !is_unstable_stat(k))
            .filter(|k| seen.insert(k.to_string()))
            .map(ToString::to_string)
            .collect();
        Self::from_keys(keys)
    }

    pub fn from_keys(keys: Vec<String>) -> Result<Self, SchemaError> {
        if keys.is_empty() {
            return Err(SchemaError::Empty);
        }
        Ok(Self { keys: keys.into() })
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn position(&self, key: &str) -> Option<usize> {
        self.keys.iter().position(|k| k == key)
    }

    /// Keys of `line` the schema lacks and schema keys absent from `line`.
    /// Unstable families never count as extra.
    pub fn diff(&self, line: &StatLine) -> (Vec<String>, Vec<String>) {
        let present: HashSet<&str> = line.keys().collect();
        let wanted: HashSet<&str> = self.keys.iter().map(String::as_str).collect();
        let missing = self
            .keys
            .iter()
            .filter(|k| !present.contains(k.as_str()))
            .cloned()
            .collect();
        let mut extra: Vec<String> = line
            .keys()
            .filter(|k| !wanted.contains(k) && !is_unstable_stat(k))
            .map(ToString::to_string)
            .collect();
        extra.dedup();
        (missing, extra)
    }

    pub fn project(&self, line: &StatLine, mode: SchemaMode) -> Result<GameSummary, SchemaError> {
        if mode == SchemaMode::Strict {
            let (missing, extra) = self.diff(line);
            if !missing.is_empty() || !extra.is_empty() {
                return Err(SchemaError::Mismatch { missing, extra });
            }
        }
        let values = self
            .keys
            .iter()
            .map(|key| line.get(key).flatten())
            .collect();
        Ok(GameSummary {
            schema: self.clone(),
            values,
        })
    }
}

/// Per-team summary aligned with a [`CanonicalSchema`].
#[derive(Debug, Clone, PartialEq)]
pub struct GameSummary {
    schema: CanonicalSchema,
    values: Vec<Option<f64>>,
}

impl GameSummary {
    pub fn schema(&self) -> &CanonicalSchema {
        &self.schema
    }

    pub fn values(&self) -> &[Option<f64>] {
        &self.values
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.schema.position(key).and_then(|i| self.values[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<f64>)> {
        self.schema
            .keys()
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }
}

/// One team's side of a game.
#[derive(Debug, Clone, PartialEq)]
pub struct TeamLine {
    pub team: String,
    pub summary: GameSummary,
    pub total: u32,
    pub home: bool,
}

/// One row per team per game: own side, mirrored opponent side, game context.
#[derive(Debug, Clone, PartialEq)]
pub struct GameRecord {
    pub own: TeamLine,
    pub opp: TeamLine,
    pub season: u16,
    pub date: NaiveDate,
    pub won: bool,
}

impl GameRecord {
    pub fn new(own: TeamLine, opp: TeamLine, season: u16, date: NaiveDate) -> Self {
        let won = own.total > opp.total;
        Self {
            own,
            opp,
            season,
            date,
            won,
        }
    }

    /// Both perspectives of one game, in the order the teams were given.
    pub fn mirrored_pair(first: TeamLine, second: TeamLine, season: u16, date: NaiveDate) -> (Self, Self) {
        let a = Self::new(first.clone(), second.clone(), season, date);
        let b = Self::new(second, first, season, date);
        (a, b)
    }

    pub fn team(&self) -> &str {
        &self.own.team
    }

    /// Flat dataset columns for `schema`: own side, `_opp` side, then game
    /// context.
    pub fn columns(schema: &CanonicalSchema) -> Vec<(String, ColumnKind)> {
        let side: Vec<(String, ColumnKind)> = schema
            .keys()
            .iter()
            .map(|k| (k.clone(), ColumnKind::Number))
            .chain([
                ("team".to_string(), ColumnKind::Text),
                ("total".to_string(), ColumnKind::Count),
                ("home".to_string(), ColumnKind::Flag),
            ])
            .collect();
        let mut columns = side.clone();
        columns.extend(side.iter().map(|(c, kind)| (format!("{c}_opp"), *kind)));
        columns.extend([
            ("season".to_string(), ColumnKind::Count),
            ("date".to_string(), ColumnKind::Date),
            ("won".to_string(), ColumnKind::Flag),
        ]);
        columns
    }

    pub fn column_names(schema: &CanonicalSchema) -> Vec<String> {
        Self::columns(schema).into_iter().map(|(name, _)| name).collect()
    }

    /// Cells in [`GameRecord::column_names`] order.
    pub fn cells(&self) -> Vec<Cell> {
        let mut cells = Vec::new();
        for side in [&self.own, &self.opp] {
            cells.extend(side.summary.values().iter().map(|v| Cell::Number(*v)));
            cells.push(Cell::Text(side.team.clone()));
            cells.push(Cell::Count(side.total));
            cells.push(Cell::Flag(side.home));
        }
        cells.push(Cell::Count(u32::from(self.season)));
        cells.push(Cell::Date(self.date));
        cells.push(Cell::Flag(self.won));
        cells
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Number,
    Text,
    Count,
    Flag,
    Date,
}

/// A single exported dataset value.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Number(Option<f64>),
    Text(String),
    Count(u32),
    Flag(bool),
    Date(NaiveDate),
}

impl Cell {
    pub fn kind(&self) -> ColumnKind {
        match self {
            Self::Number(_) => ColumnKind::Number,
            Self::Text(_) => ColumnKind::Text,
            Self::Count(_) => ColumnKind::Count,
            Self::Flag(_) => ColumnKind::Flag,
            Self::Date(_) => ColumnKind::Date,
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(Some(v)) => write!(f, "{v}"),
            Self::Number(None) => Ok(()),
            Self::Text(s) => f.write_str(s),
            Self::Count(n) => write!(f, "{n}"),
            Self::Flag(b) => f.write_str(if *b { "True" } else { "False" }),
            Self::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}
