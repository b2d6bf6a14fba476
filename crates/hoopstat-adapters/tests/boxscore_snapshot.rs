use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use hoopstat_adapters::{extract_game, ExtractError, SchemaRegistry};
use hoopstat_core::{GameRecord, SchemaMode};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct GoldenRecord {
    team: String,
    team_opp: String,
    total: u32,
    total_opp: u32,
    home: bool,
    won: bool,
    season: u16,
    date: String,
    pts: f64,
    pts_max: f64,
    ast_max: f64,
    plus_minus_max: f64,
    ts_pct_max: f64,
    ortg: f64,
    pts_opp: f64,
    pts_max_opp: f64,
}

fn fixtures_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/boxscores")
}

fn fixture(id: &str) -> String {
    fs::read_to_string(fixtures_dir().join(id)).expect("read fixture")
}

fn stat(record: &GameRecord, key: &str) -> f64 {
    record
        .own
        .summary
        .get(key)
        .unwrap_or_else(|| panic!("{key} missing for {}", record.team()))
}

fn to_golden(record: &GameRecord) -> GoldenRecord {
    GoldenRecord {
        team: record.own.team.clone(),
        team_opp: record.opp.team.clone(),
        total: record.own.total,
        total_opp: record.opp.total,
        home: record.own.home,
        won: record.won,
        season: record.season,
        date: record.date.format("%Y-%m-%d").to_string(),
        pts: stat(record, "pts"),
        pts_max: stat(record, "pts_max"),
        ast_max: stat(record, "ast_max"),
        plus_minus_max: stat(record, "+/-_max"),
        ts_pct_max: stat(record, "ts%_max"),
        ortg: stat(record, "ortg"),
        pts_opp: record.opp.summary.get("pts").expect("pts_opp"),
        pts_max_opp: record.opp.summary.get("pts_max").expect("pts_max_opp"),
    }
}

fn snapshot() -> BTreeMap<String, Vec<GoldenRecord>> {
    let text = fs::read_to_string(fixtures_dir().join("snapshot.json")).expect("read snapshot");
    serde_json::from_str(&text).expect("parse snapshot")
}

#[test]
fn golden_snapshot_for_every_fixture() {
    let expected = snapshot();
    let mut registry = SchemaRegistry::first_document_wins(SchemaMode::Strict);
    for (id, golden) in &expected {
        let (away, home) = extract_game(id, &fixture(id), &mut registry).unwrap();
        assert_eq!(&vec![to_golden(&away), to_golden(&home)], golden, "{id}");
    }
}

#[test]
fn winner_and_loser_mirror_each_other() {
    let mut registry = SchemaRegistry::first_document_wins(SchemaMode::Strict);
    let (lal, bos) = extract_game("202301280BOS.html", &fixture("202301280BOS.html"), &mut registry).unwrap();

    assert_eq!((lal.team(), lal.own.total, lal.opp.total, lal.won), ("LAL", 104, 110, false));
    assert_eq!((bos.team(), bos.own.total, bos.opp.total, bos.won), ("BOS", 110, 104, true));
    assert_eq!(lal.opp, bos.own);
    assert_eq!(bos.opp, lal.own);
    assert_ne!(lal.own.total, lal.opp.total);
    assert!(lal.won ^ bos.won);

    let mp_max = bos.own.summary.get("mp_max").unwrap();
    assert!((mp_max - 37.75).abs() < 1e-9);
    assert_eq!(bos.own.summary.get("+/-"), None);
}

#[test]
fn batch_shares_the_first_schema() {
    let mut registry = SchemaRegistry::first_document_wins(SchemaMode::Strict);
    let (first, _) = extract_game("202210180GSW.html", &fixture("202210180GSW.html"), &mut registry).unwrap();
    let (second, _) = extract_game("202301280BOS.html", &fixture("202301280BOS.html"), &mut registry).unwrap();

    let keys = first.own.summary.schema().keys();
    assert_eq!(
        keys,
        [
            "mp", "fg", "fga", "fg%", "3p", "trb", "ast", "pts", "+/-", "ts%", "usg%", "ortg", "drtg",
            "mp_max", "fg_max", "fga_max", "fg%_max", "3p_max", "trb_max", "ast_max", "pts_max",
            "+/-_max", "ts%_max", "usg%_max", "ortg_max", "drtg_max",
        ]
    );
    assert_eq!(second.own.summary.schema().keys(), keys);
    assert!(keys.iter().all(|k| !k.contains("bpm")));
}

#[test]
fn missing_stat_table_is_reported_and_schema_stays_unpinned() {
    let markup = fixture("202301280BOS.html").replace("box-BOS-game-advanced", "box-BOS-game-other");
    let mut registry = SchemaRegistry::first_document_wins(SchemaMode::Strict);
    let err = extract_game("202301280BOS.html", &markup, &mut registry).unwrap_err();
    assert!(matches!(&err, ExtractError::MissingTable { id } if id == "box-BOS-game-advanced"));
    assert!(registry.schema().is_none());
}

#[test]
fn tied_line_score_is_rejected() {
    let markup = fixture("202301280BOS.html").replace("<strong>110</strong>", "<strong>104</strong>");
    let mut registry = SchemaRegistry::first_document_wins(SchemaMode::Strict);
    let err = extract_game("202301280BOS.html", &markup, &mut registry).unwrap_err();
    assert!(matches!(err, ExtractError::Tie { total: 104, .. }));
}

#[test]
fn renamed_column_fails_strict_and_reindexes_leniently() {
    let first = fixture("202210180GSW.html");
    let renamed = fixture("202301280BOS.html").replace(">AST</th>", ">AS</th>");

    let mut strict = SchemaRegistry::first_document_wins(SchemaMode::Strict);
    extract_game("202210180GSW.html", &first, &mut strict).unwrap();
    assert!(matches!(
        extract_game("202301280BOS.html", &renamed, &mut strict),
        Err(ExtractError::Schema(_))
    ));

    let mut lenient = SchemaRegistry::first_document_wins(SchemaMode::Reindex);
    extract_game("202210180GSW.html", &first, &mut lenient).unwrap();
    let (lal, _) = extract_game("202301280BOS.html", &renamed, &mut lenient).unwrap();
    assert_eq!(lal.own.summary.get("ast"), None);
    assert_eq!(lal.own.summary.get("pts"), Some(104.0));
}

fn rename_in_table(markup: &str, table_id: &str, from: &str, to: &str) -> String {
    let start = markup.find(&format!("id=\"{table_id}\"")).expect("table present");
    let end = start + markup[start..].find("</table>").expect("table closed");
    format!(
        "{}{}{}",
        &markup[..start],
        markup[start..end].replace(from, to),
        &markup[end..]
    )
}

#[test]
fn failed_home_table_does_not_pin_the_schema() {
    let markup = rename_in_table(&fixture("202301280BOS.html"), "box-BOS-game-basic", ">AST</th>", ">AS</th>");
    let mut registry = SchemaRegistry::first_document_wins(SchemaMode::Strict);
    let err = extract_game("202301280BOS.html", &markup, &mut registry).unwrap_err();
    assert!(matches!(err, ExtractError::Schema(_)));
    assert!(registry.schema().is_none());

    let (gsw_away, _) = extract_game("202210180GSW.html", &fixture("202210180GSW.html"), &mut registry).unwrap();
    assert_eq!(registry.schema(), Some(gsw_away.own.summary.schema()));
    assert!(registry.schema().unwrap().position("ast").is_some());
}
