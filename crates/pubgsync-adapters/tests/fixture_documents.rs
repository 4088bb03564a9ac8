use std::path::{Path, PathBuf};

use pubgsync_adapters::documents::{
    parse_lifetime_stats, parse_match, parse_players, parse_ranked_stats, parse_season_stats,
    parse_seasons,
};

fn fixture(name: &str) -> Vec<u8> {
    let path: PathBuf = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(name);
    std::fs::read(&path).unwrap_or_else(|err| panic!("reading {}: {err}", path.display()))
}

#[test]
fn players_fixture_carries_match_references() {
    let players = parse_players(&fixture("players.json")).expect("players");
    assert_eq!(players.len(), 2);

    let alpha = &players[0];
    assert_eq!(alpha.player.player_id, "account.alpha");
    assert_eq!(alpha.player.name, "Alpha");
    assert_eq!(alpha.player.shard, "steam");
    assert_eq!(alpha.match_ids, vec!["match-1", "match-2", "match-3"]);

    assert!(players[1].match_ids.is_empty());
}

#[test]
fn seasons_fixture_has_exactly_one_current_season() {
    let seasons = parse_seasons(&fixture("seasons.json")).expect("seasons");
    assert_eq!(seasons.len(), 3);
    let current: Vec<_> = seasons.iter().filter(|s| s.is_current).collect();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].season_id, "division.bro.official.pc-2018-31");
    assert!(seasons[1].is_off_season);
}

#[test]
fn match_fixture_keeps_participants_and_skips_rosters_and_assets() {
    let doc = parse_match(&fixture("match.json")).expect("match");
    assert_eq!(doc.record.match_id, "match-1");
    assert_eq!(doc.record.mode, "squad-fpp");
    assert_eq!(doc.record.map, "Baltic_Main");
    assert_eq!(doc.record.duration, 1843);
    assert_eq!(doc.record.season_state, "progress");
    assert_eq!(doc.record.created_at.to_rfc3339(), "2026-02-20T18:22:31+00:00");

    assert_eq!(doc.participants.len(), 2);
    let alpha = &doc.participants[0];
    assert_eq!(alpha.player_id, "account.alpha");
    assert_eq!(alpha.stats.kills, 4);
    assert_eq!(alpha.stats.dbnos, 1);
    assert_eq!(alpha.stats.death_type, "byplayer");
}

#[test]
fn season_stats_fixture_fans_out_over_six_modes() {
    let doc = parse_season_stats(&fixture("season_stats.json")).expect("season stats");
    assert_eq!(doc.player_id, "account.alpha");
    assert_eq!(doc.season_id, "division.bro.official.pc-2018-31");
    assert_eq!(doc.game_modes.len(), 6);
    assert_eq!(doc.game_modes["squad-fpp"].kills, 12);
    assert_eq!(doc.match_ids, vec!["match-1", "match-2"]);
}

#[test]
fn ranked_fixture_reads_tiers() {
    let doc = parse_ranked_stats(&fixture("ranked_stats.json")).expect("ranked");
    assert_eq!(doc.game_modes.len(), 2);
    let squad_fpp = &doc.game_modes["squad-fpp"];
    assert_eq!(squad_fpp.current_tier.tier, "Gold");
    assert_eq!(squad_fpp.current_tier.sub_tier, "2");
    assert_eq!(squad_fpp.current_rank_point, 2101);
}

#[test]
fn lifetime_fixture_is_keyed_by_player_only() {
    let doc = parse_lifetime_stats(&fixture("lifetime_stats.json")).expect("lifetime");
    assert_eq!(doc.player_id, "account.alpha");
    assert_eq!(doc.game_modes.len(), 6);
}

#[test]
fn truncated_documents_are_rejected() {
    let body = fixture("season_stats.json");
    let truncated = &body[..body.len() / 2];
    assert!(parse_season_stats(truncated).is_err());
}
