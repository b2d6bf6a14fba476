//! Markup adapters: link discovery over crawled fragments and box-score
//! extraction into mirrored game records.

use std::collections::HashSet;

use chrono::NaiveDate;
use hoopstat_core::{
    CanonicalSchema, CrawlResource, GameRecord, GameSummary, PlayerRow, ResourceKind, SchemaError,
    SchemaMode, StatLine, TeamLine, TeamStatTable, BOX_SCORE_MARKER,
};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "hoopstat-adapters";

/// Row classes that carry decoration, not data.
const DECORATIVE_ROW_CLASSES: [&str; 2] = ["over_header", "thead"];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("table #{id} not found")]
    MissingTable { id: String },
    #[error("table #{id} has no header row")]
    MissingHeader { id: String },
    #[error("table #{id} has no team totals row")]
    MissingTotals { id: String },
    #[error("malformed line score: {0}")]
    MalformedLineScore(String),
    #[error("no season link in #bottom_nav_container")]
    MissingSeason,
    #[error("unparseable season in link {0}")]
    BadSeason(String),
    #[error("resource id {0} does not start with a YYYYMMDD date")]
    BadFilename(String),
    #[error("tied game: {away} {total} - {home} {total}")]
    Tie { away: String, home: String, total: u32 },
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("invalid selector {0}")]
    Selector(String),
}

fn selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::Selector(format!("{css}: {e}")))
}

/// Every anchor href in `markup`, in document order.
pub fn extract_hrefs(markup: &str) -> Result<Vec<String>, ExtractError> {
    let document = Html::parse_fragment(markup);
    let sel = selector("a[href]")?;
    Ok(document
        .select(&sel)
        .filter_map(|a| a.value().attr("href"))
        .map(|href| href.trim().to_string())
        .filter(|href| !href.is_empty())
        .collect())
}

fn resources_from_hrefs<'a>(
    kind: ResourceKind,
    base_url: &str,
    hrefs: impl Iterator<Item = &'a str>,
) -> Vec<CrawlResource> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for href in hrefs {
        match CrawlResource::from_href(kind, base_url, href) {
            Ok(resource) => {
                if seen.insert(resource.id.clone()) {
                    out.push(resource);
                }
            }
            Err(err) => debug!(href, error = %err, "skipping unusable link"),
        }
    }
    out
}

/// Schedule pages linked from a season index fragment.
pub fn schedule_page_links(
    base_url: &str,
    season_index_markup: &str,
) -> Result<Vec<CrawlResource>, ExtractError> {
    let hrefs = extract_hrefs(season_index_markup)?;
    Ok(resources_from_hrefs(
        ResourceKind::SchedulePage,
        base_url,
        hrefs.iter().map(String::as_str),
    ))
}

/// Box scores linked from a schedule page fragment.
pub fn box_score_links(base_url: &str, schedule_markup: &str) -> Result<Vec<CrawlResource>, ExtractError> {
    let hrefs = extract_hrefs(schedule_markup)?;
    Ok(resources_from_hrefs(
        ResourceKind::BoxScore,
        base_url,
        hrefs
            .iter()
            .map(String::as_str)
            .filter(|href| href.contains(BOX_SCORE_MARKER)),
    ))
}

/// Coerce a stat cell to a number. Handles `.512`, `+7`, and `MM:SS`
/// minutes; anything else is empty.
pub fn parse_stat_cell(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Some((minutes, seconds)) = text.split_once(':') {
        let minutes: f64 = minutes.parse().ok()?;
        let seconds: f64 = seconds.parse().ok()?;
        return Some(minutes + seconds / 60.0);
    }
    text.strip_prefix('+').unwrap_or(text).parse().ok().filter(|v: &f64| v.is_finite())
}

/// Text cells of one table after decorative rows are dropped. The first cell
/// of every row is kept (team or player label).
#[derive(Debug, Clone, PartialEq)]
pub struct RawTable {
    pub id: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

fn is_decorative(row: &ElementRef<'_>) -> bool {
    row.value()
        .classes()
        .any(|class| DECORATIVE_ROW_CLASSES.contains(&class))
}

fn row_cells(row: &ElementRef<'_>, cell_sel: &Selector) -> Vec<String> {
    row.select(cell_sel)
        .map(|cell| cell.text().collect::<String>().trim().to_string())
        .collect()
}

fn table_from_element(id: &str, table: ElementRef<'_>) -> Result<RawTable, ExtractError> {
    let head_sel = selector("thead tr")?;
    let body_sel = selector("tbody tr, tfoot tr")?;
    let cell_sel = selector("th, td")?;

    let headers = table
        .select(&head_sel)
        .filter(|row| !is_decorative(row))
        .last()
        .map(|row| row_cells(&row, &cell_sel))
        .ok_or_else(|| ExtractError::MissingHeader { id: id.to_string() })?;

    let rows = table
        .select(&body_sel)
        .filter(|row| !is_decorative(row))
        .map(|row| row_cells(&row, &cell_sel))
        .filter(|cells| !cells.is_empty())
        .collect();

    Ok(RawTable {
        id: id.to_string(),
        headers,
        rows,
    })
}

/// Read table `#id`. Tables the site ships inside HTML comments are found by
/// re-parsing the comment that mentions the id.
pub fn read_table(document: &Html, id: &str) -> Result<RawTable, ExtractError> {
    let sel = selector(&format!("table[id=\"{id}\"]"))?;
    if let Some(table) = document.select(&sel).next() {
        return table_from_element(id, table);
    }

    let needle = format!("id=\"{id}\"");
    for node in document.tree.nodes() {
        let Some(comment) = node.value().as_comment() else {
            continue;
        };
        let text: &str = comment;
        if !text.contains(&needle) {
            continue;
        }
        let fragment = Html::parse_fragment(text);
        if let Some(table) = fragment.select(&sel).next() {
            return table_from_element(id, table);
        }
    }

    Err(ExtractError::MissingTable { id: id.to_string() })
}

/// Map a raw per-team table to numbers. The first column is the row label;
/// the last body row is the team totals row.
pub fn to_stat_table(raw: &RawTable) -> Result<TeamStatTable, ExtractError> {
    let columns: Vec<String> = raw.headers.iter().skip(1).cloned().collect();
    let numeric = |cells: &[String]| -> Vec<Option<f64>> {
        (0..columns.len())
            .map(|i| cells.get(i + 1).and_then(|c| parse_stat_cell(c)))
            .collect()
    };

    let Some((totals, players)) = raw.rows.split_last() else {
        return Err(ExtractError::MissingTotals { id: raw.id.clone() });
    };

    Ok(TeamStatTable {
        players: players
            .iter()
            .map(|cells| PlayerRow {
                name: cells.first().cloned().unwrap_or_default(),
                values: numeric(cells),
            })
            .collect(),
        totals: numeric(totals),
        columns,
    })
}

/// Team abbreviation and final total, in line-score order (away, then home).
pub fn read_line_score(document: &Html) -> Result<Vec<(String, u32)>, ExtractError> {
    let raw = read_table(document, "line_score")?;
    let teams = raw
        .rows
        .iter()
        .map(|cells| -> Result<(String, u32), ExtractError> {
            let team = cells
                .first()
                .filter(|t| !t.is_empty())
                .ok_or_else(|| ExtractError::MalformedLineScore("row without team".into()))?;
            let total = cells
                .last()
                .and_then(|t| t.parse::<u32>().ok())
                .ok_or_else(|| ExtractError::MalformedLineScore(format!("no final total for {team}")))?;
            Ok((team.clone(), total))
        })
        .collect::<Result<Vec<_>, ExtractError>>()?;

    if teams.len() != 2 {
        return Err(ExtractError::MalformedLineScore(format!(
            "expected 2 teams, found {}",
            teams.len()
        )));
    }
    Ok(teams)
}

pub fn team_table_id(team: &str, category: &str) -> String {
    format!("box-{team}-game-{category}")
}

/// Unprojected summary for one team: basic then advanced totals, then the
/// per-player maxima of both.
pub fn team_stat_line(document: &Html, team: &str) -> Result<StatLine, ExtractError> {
    let basic = to_stat_table(&read_table(document, &team_table_id(team, "basic"))?)?;
    let advanced = to_stat_table(&read_table(document, &team_table_id(team, "advanced"))?)?;
    Ok(StatLine::from_tables(&[&basic, &advanced]))
}

/// Season from the second link of the bottom navigation, e.g.
/// `/teams/BOS/2023_games.html` -> 2023.
pub fn read_season(document: &Html) -> Result<u16, ExtractError> {
    let sel = selector("#bottom_nav_container a[href]")?;
    let href = document
        .select(&sel)
        .filter_map(|a| a.value().attr("href"))
        .nth(1)
        .ok_or(ExtractError::MissingSeason)?;
    let basename = href.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
    basename
        .split('_')
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ExtractError::BadSeason(href.to_string()))
}

/// Game date from the fixed `YYYYMMDD` prefix of a box-score id.
pub fn date_from_resource_id(id: &str) -> Result<NaiveDate, ExtractError> {
    id.get(..8)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y%m%d").ok())
        .ok_or_else(|| ExtractError::BadFilename(id.to_string()))
}

/// Holds the canonical schema for one extraction batch. Constructed once and
/// passed to every [`extract_game`] call of the batch.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    schema: Option<CanonicalSchema>,
    mode: SchemaMode,
}

impl SchemaRegistry {
    /// The first projected stat line fixes the schema.
    pub fn first_document_wins(mode: SchemaMode) -> Self {
        Self { schema: None, mode }
    }

    /// Use a schema fixed up front, e.g. from a previous batch.
    pub fn pinned(schema: CanonicalSchema, mode: SchemaMode) -> Self {
        Self {
            schema: Some(schema),
            mode,
        }
    }

    pub fn schema(&self) -> Option<&CanonicalSchema> {
        self.schema.as_ref()
    }

    pub fn mode(&self) -> SchemaMode {
        self.mode
    }

    /// Project both sides of one game. A schema derived here is kept only
    /// when both lines project; a failed game leaves the registry untouched.
    pub fn project_pair(
        &mut self,
        away: &StatLine,
        home: &StatLine,
    ) -> Result<(GameSummary, GameSummary), SchemaError> {
        let schema = match &self.schema {
            Some(schema) => schema.clone(),
            None => CanonicalSchema::from_stat_line(away)?,
        };
        let away_summary = self.project_onto(&schema, away)?;
        let home_summary = self.project_onto(&schema, home)?;
        if self.schema.is_none() {
            debug!(keys = schema.len(), "pinned canonical schema");
            self.schema = Some(schema);
        }
        Ok((away_summary, home_summary))
    }

    fn project_onto(&self, schema: &CanonicalSchema, line: &StatLine) -> Result<GameSummary, SchemaError> {
        if self.mode == SchemaMode::Reindex {
            let (missing, extra) = schema.diff(line);
            if !missing.is_empty() || !extra.is_empty() {
                warn!(?missing, ?extra, "reindexing stat line onto canonical schema");
            }
        }
        schema.project(line, self.mode)
    }
}

/// Turn one stored box score into its two game records, in line-score order
/// (away first). `id` is the artifact id and supplies the game date.
///
/// Nothing is pinned in `registry` unless the whole document parsed.
pub fn extract_game(
    id: &str,
    markup: &str,
    registry: &mut SchemaRegistry,
) -> Result<(GameRecord, GameRecord), ExtractError> {
    let date = date_from_resource_id(id)?;
    let document = Html::parse_document(markup);

    let teams = read_line_score(&document)?;
    let (away, away_total) = teams[0].clone();
    let (home, home_total) = teams[1].clone();
    if away_total == home_total {
        return Err(ExtractError::Tie {
            away,
            home,
            total: away_total,
        });
    }

    let away_line = team_stat_line(&document, &away)?;
    let home_line = team_stat_line(&document, &home)?;
    let season = read_season(&document)?;

    let (away_summary, home_summary) = registry.project_pair(&away_line, &home_line)?;

    Ok(GameRecord::mirrored_pair(
        TeamLine {
            team: away,
            summary: away_summary,
            total: away_total,
            home: false,
        },
        TeamLine {
            team: home,
            summary: home_summary,
            total: home_total,
            home: true,
        },
        season,
        date,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://www.basketball-reference.com";

    #[test]
    fn season_index_links_become_schedule_pages() {
        let markup = r#"
            <div><a href="/leagues/NBA_2023_games-october.html">October</a></div>
            <div><a href="/leagues/NBA_2023_games-november.html">November</a></div>
            <div><a href="/leagues/NBA_2023_games-october.html">dup</a></div>
        "#;
        let pages = schedule_page_links(BASE, markup).unwrap();
        let ids: Vec<&str> = pages.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["NBA_2023_games-october.html", "NBA_2023_games-november.html"]);
        assert!(pages.iter().all(|p| p.kind == ResourceKind::SchedulePage));
        assert_eq!(pages[0].selector, "#all_schedule");
    }

    #[test]
    fn only_box_score_links_are_followed() {
        let markup = r#"
            <table><tr>
              <td><a href="/teams/BOS/2023.html">Boston</a></td>
              <td><a href="/boxscores/202210180BOS.html">Box Score</a></td>
              <td><a href="/boxscores/?month=10">index</a></td>
              <td><a>no href</a></td>
            </tr></table>
        "#;
        let scores = box_score_links(BASE, markup).unwrap();
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].url, format!("{BASE}/boxscores/202210180BOS.html"));
        assert_eq!(scores[0].kind, ResourceKind::BoxScore);
    }

    #[test]
    fn stat_cells_coerce_like_numbers() {
        assert_eq!(parse_stat_cell("42"), Some(42.0));
        assert_eq!(parse_stat_cell(".512"), Some(0.512));
        assert_eq!(parse_stat_cell("+7"), Some(7.0));
        assert_eq!(parse_stat_cell("-3"), Some(-3.0));
        assert_eq!(parse_stat_cell("34:30"), Some(34.5));
        assert_eq!(parse_stat_cell("Did Not Play"), None);
        assert_eq!(parse_stat_cell(""), None);
    }

    #[test]
    fn decorative_rows_are_dropped_before_reading() {
        let doc = Html::parse_document(
            r#"<table id="t">
                <thead>
                  <tr class="over_header"><th colspan="3">Basic Box Score Stats</th></tr>
                  <tr><th>Starters</th><th>MP</th><th>PTS</th></tr>
                </thead>
                <tbody>
                  <tr><th>A</th><td>30:00</td><td>20</td></tr>
                  <tr class="thead"><th>Reserves</th><th>MP</th><th>PTS</th></tr>
                  <tr><th>B</th><td colspan="2">Did Not Play</td></tr>
                </tbody>
                <tfoot><tr><th>Team Totals</th><td>240</td><td>20</td></tr></tfoot>
            </table>"#,
        );
        let raw = read_table(&doc, "t").unwrap();
        assert_eq!(raw.headers, ["Starters", "MP", "PTS"]);
        assert_eq!(raw.rows.len(), 3);

        let table = to_stat_table(&raw).unwrap();
        assert_eq!(table.columns, ["MP", "PTS"]);
        assert_eq!(table.players.len(), 2);
        assert_eq!(table.players[1].values, [None, None]);
        assert_eq!(table.totals, [Some(240.0), Some(20.0)]);
        assert_eq!(table.column_max(0), Some(30.0));
    }

    #[test]
    fn tables_inside_comments_are_found() {
        let doc = Html::parse_document(
            r#"<div id="all_line_score"><!--
                <table id="line_score"><thead><tr><th></th><th>T</th></tr></thead>
                <tbody><tr><th>PHI</th><td>117</td></tr><tr><th>BOS</th><td>126</td></tr></tbody></table>
            --></div>"#,
        );
        let teams = read_line_score(&doc).unwrap();
        assert_eq!(teams, [("PHI".to_string(), 117), ("BOS".to_string(), 126)]);
    }

    #[test]
    fn missing_table_names_the_id() {
        let doc = Html::parse_document("<div></div>");
        let err = read_table(&doc, "box-BOS-game-basic").unwrap_err();
        assert_eq!(err.to_string(), "table #box-BOS-game-basic not found");
    }

    #[test]
    fn season_comes_from_second_nav_link() {
        let doc = Html::parse_document(
            r#"<div id="bottom_nav_container">
                 <a href="/boxscores/">Box Scores</a>
                 <a href="/teams/BOS/2023_games.html">Schedule</a>
               </div>"#,
        );
        assert_eq!(read_season(&doc).unwrap(), 2023);
        assert!(matches!(
            read_season(&Html::parse_document("<p/>")),
            Err(ExtractError::MissingSeason)
        ));
    }

    #[test]
    fn date_comes_from_id_prefix() {
        assert_eq!(
            date_from_resource_id("202210180BOS.html").unwrap(),
            NaiveDate::from_ymd_opt(2022, 10, 18).unwrap()
        );
        assert!(date_from_resource_id("BOS.html").is_err());
    }

    fn line(entries: &[(&str, Option<f64>)]) -> StatLine {
        StatLine::from_entries(entries.iter().map(|(k, v)| (k.to_string(), *v)).collect())
    }

    #[test]
    fn registry_pins_first_game_and_reuses_it() {
        let mut registry = SchemaRegistry::first_document_wins(SchemaMode::Strict);
        let first = line(&[("pts", Some(100.0)), ("bpm", Some(0.0)), ("pts_max", Some(30.0))]);
        let (away, home) = registry.project_pair(&first, &first).unwrap();
        assert_eq!(away.schema().keys(), ["pts", "pts_max"]);
        assert_eq!(home.get("pts"), Some(100.0));

        let renamed = line(&[("points", Some(1.0)), ("pts_max", None)]);
        assert!(matches!(
            registry.project_pair(&first, &renamed),
            Err(SchemaError::Mismatch { .. })
        ));
        assert_eq!(registry.schema().unwrap().keys(), ["pts", "pts_max"]);
    }

    #[test]
    fn failed_home_side_leaves_registry_unpinned() {
        let mut registry = SchemaRegistry::first_document_wins(SchemaMode::Strict);
        let away = line(&[("pts", Some(100.0)), ("ast", Some(20.0))]);
        let home = line(&[("pts", Some(98.0)), ("as", Some(22.0))]);
        assert!(registry.project_pair(&away, &home).is_err());
        assert!(registry.schema().is_none());

        let (_, next_home) = registry.project_pair(&home, &home).unwrap();
        assert_eq!(next_home.schema().keys(), ["pts", "as"]);
    }

    #[test]
    fn pinned_registry_projects_onto_the_given_schema() {
        let schema = CanonicalSchema::from_keys(vec!["pts".into(), "ast".into()]).unwrap();
        let mut strict = SchemaRegistry::pinned(schema.clone(), SchemaMode::Strict);
        let first = line(&[("pts", Some(100.0)), ("trb", Some(40.0))]);
        assert!(strict.project_pair(&first, &first).is_err());
        assert_eq!(strict.schema(), Some(&schema));

        let mut lenient = SchemaRegistry::pinned(schema, SchemaMode::Reindex);
        assert_eq!(lenient.mode(), SchemaMode::Reindex);
        let (away, _) = lenient.project_pair(&first, &first).unwrap();
        assert_eq!(away.values(), [Some(100.0), None]);
    }

    #[test]
    fn hrefs_are_trimmed_and_blank_ones_dropped() {
        let hrefs = extract_hrefs(r#"<a href=" /a.html ">a</a><a href="">b</a><a>c</a>"#).unwrap();
        assert_eq!(hrefs, ["/a.html"]);
    }
}
