//! Typed upstream documents, validated when parsed.
//!
//! The upstream speaks JSON:API. Only the parts the reconciler needs are modelled;
//! everything else in a payload is ignored.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use pubgsync_core::{
    GameModeStats, Match, MatchStats, Player, RankedGameModeStats, Season, LIFETIME_SEASON_ID,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlayerDocument {
    pub player: Player,
    pub match_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub player_id: String,
    pub name: String,
    pub stats: MatchStats,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchDocument {
    pub record: Match,
    pub participants: Vec<Participant>,
}

/// Fan-out document: one stats block per game mode for a (player, season).
#[derive(Debug, Clone, PartialEq)]
pub struct SeasonStatsDocument {
    pub player_id: String,
    pub season_id: String,
    pub game_modes: BTreeMap<String, GameModeStats>,
    pub match_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedStatsDocument {
    pub player_id: String,
    pub season_id: String,
    pub game_modes: BTreeMap<String, RankedGameModeStats>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LifetimeStatsDocument {
    pub player_id: String,
    pub game_modes: BTreeMap<String, GameModeStats>,
}

#[derive(Debug, Deserialize)]
struct ListEnvelope<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct SingleEnvelope<T> {
    data: T,
    #[serde(default)]
    included: Vec<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct ResourceRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ToOne {
    data: ResourceRef,
}

#[derive(Debug, Default, Deserialize)]
struct ToMany {
    #[serde(default)]
    data: Vec<ResourceRef>,
}

#[derive(Debug, Deserialize)]
struct PlayerResource {
    id: String,
    attributes: PlayerAttributes,
    #[serde(default)]
    relationships: PlayerRelationships,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayerAttributes {
    name: String,
    shard_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct PlayerRelationships {
    #[serde(default)]
    matches: ToMany,
}

#[derive(Debug, Deserialize)]
struct SeasonResource {
    id: String,
    attributes: SeasonAttributes,
}

#[derive(Debug, Deserialize)]
struct SeasonAttributes {
    #[serde(rename = "isCurrentSeason")]
    is_current_season: bool,
    #[serde(rename = "isOffseason")]
    is_offseason: bool,
}

#[derive(Debug, Deserialize)]
struct MatchResource {
    id: String,
    attributes: MatchAttributes,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MatchAttributes {
    created_at: DateTime<Utc>,
    duration: i32,
    game_mode: String,
    map_name: String,
    is_custom_match: bool,
    season_state: String,
    shard_id: String,
}

#[derive(Debug, Deserialize)]
struct ParticipantResource {
    attributes: ParticipantAttributes,
}

#[derive(Debug, Deserialize)]
struct ParticipantAttributes {
    stats: ParticipantStats,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParticipantStats {
    name: String,
    player_id: String,
    #[serde(flatten)]
    stats: MatchStats,
}

#[derive(Debug, Deserialize)]
struct PlayerSeasonResource {
    attributes: PlayerSeasonAttributes,
    relationships: PlayerSeasonRelationships,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayerSeasonAttributes {
    game_mode_stats: BTreeMap<String, GameModeStats>,
}

#[derive(Debug, Deserialize)]
struct PlayerSeasonRelationships {
    player: ToOne,
    season: ToOne,
    #[serde(default, rename = "matchesSolo")]
    matches_solo: ToMany,
    #[serde(default, rename = "matchesSoloFPP")]
    matches_solo_fpp: ToMany,
    #[serde(default, rename = "matchesDuo")]
    matches_duo: ToMany,
    #[serde(default, rename = "matchesDuoFPP")]
    matches_duo_fpp: ToMany,
    #[serde(default, rename = "matchesSquad")]
    matches_squad: ToMany,
    #[serde(default, rename = "matchesSquadFPP")]
    matches_squad_fpp: ToMany,
}

#[derive(Debug, Deserialize)]
struct RankedResource {
    attributes: RankedAttributes,
    relationships: RankedRelationships,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RankedAttributes {
    ranked_game_mode_stats: BTreeMap<String, RankedGameModeStats>,
}

#[derive(Debug, Deserialize)]
struct RankedRelationships {
    player: ToOne,
    season: ToOne,
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, DocumentError> {
    Ok(serde_json::from_slice(body)?)
}

fn require_id(kind: &str, id: String) -> Result<String, DocumentError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        return Err(DocumentError::Invalid(format!("{kind} id is empty")));
    }
    Ok(trimmed.to_string())
}

fn require_modes<T>(modes: &BTreeMap<String, T>) -> Result<(), DocumentError> {
    if modes.keys().any(|mode| mode.trim().is_empty()) {
        return Err(DocumentError::Invalid("empty game mode key".to_string()));
    }
    Ok(())
}

fn collect_ids(kind: &str, refs: Vec<ResourceRef>) -> Result<Vec<String>, DocumentError> {
    refs.into_iter().map(|r| require_id(kind, r.id)).collect()
}

pub fn parse_players(body: &[u8]) -> Result<Vec<PlayerDocument>, DocumentError> {
    let envelope: ListEnvelope<PlayerResource> = decode(body)?;
    envelope
        .data
        .into_iter()
        .map(|resource| {
            let player_id = require_id("player", resource.id)?;
            let match_ids = collect_ids("match", resource.relationships.matches.data)?;
            Ok(PlayerDocument {
                player: Player {
                    player_id,
                    name: resource.attributes.name,
                    shard: resource.attributes.shard_id,
                },
                match_ids,
            })
        })
        .collect()
}

pub fn parse_seasons(body: &[u8]) -> Result<Vec<Season>, DocumentError> {
    let envelope: ListEnvelope<SeasonResource> = decode(body)?;
    envelope
        .data
        .into_iter()
        .map(|resource| {
            Ok(Season {
                season_id: require_id("season", resource.id)?,
                is_current: resource.attributes.is_current_season,
                is_off_season: resource.attributes.is_offseason,
            })
        })
        .collect()
}

pub fn parse_match(body: &[u8]) -> Result<MatchDocument, DocumentError> {
    let envelope: SingleEnvelope<MatchResource> = decode(body)?;
    let attributes = envelope.data.attributes;
    let record = Match {
        match_id: require_id("match", envelope.data.id)?,
        created_at: attributes.created_at,
        duration: attributes.duration,
        mode: attributes.game_mode,
        map: attributes.map_name,
        is_custom: attributes.is_custom_match,
        season_state: attributes.season_state,
        shard: attributes.shard_id,
    };

    let mut participants = Vec::new();
    for item in envelope.included {
        if item.get("type").and_then(JsonValue::as_str) != Some("participant") {
            continue;
        }
        let resource: ParticipantResource = serde_json::from_value(item)?;
        let stats = resource.attributes.stats;
        participants.push(Participant {
            player_id: require_id("participant player", stats.player_id)?,
            name: stats.name,
            stats: stats.stats,
        });
    }

    Ok(MatchDocument {
        record,
        participants,
    })
}

pub fn parse_season_stats(body: &[u8]) -> Result<SeasonStatsDocument, DocumentError> {
    let envelope: SingleEnvelope<PlayerSeasonResource> = decode(body)?;
    let resource = envelope.data;
    require_modes(&resource.attributes.game_mode_stats)?;
    let rel = resource.relationships;

    let mut match_ids = Vec::new();
    for list in [
        rel.matches_solo,
        rel.matches_solo_fpp,
        rel.matches_duo,
        rel.matches_duo_fpp,
        rel.matches_squad,
        rel.matches_squad_fpp,
    ] {
        match_ids.extend(collect_ids("match", list.data)?);
    }
    match_ids.sort();
    match_ids.dedup();

    Ok(SeasonStatsDocument {
        player_id: require_id("player", rel.player.data.id)?,
        season_id: require_id("season", rel.season.data.id)?,
        game_modes: resource.attributes.game_mode_stats,
        match_ids,
    })
}

pub fn parse_ranked_stats(body: &[u8]) -> Result<RankedStatsDocument, DocumentError> {
    let envelope: SingleEnvelope<RankedResource> = decode(body)?;
    let resource = envelope.data;
    require_modes(&resource.attributes.ranked_game_mode_stats)?;
    Ok(RankedStatsDocument {
        player_id: require_id("player", resource.relationships.player.data.id)?,
        season_id: require_id("season", resource.relationships.season.data.id)?,
        game_modes: resource.attributes.ranked_game_mode_stats,
    })
}

pub fn parse_lifetime_stats(body: &[u8]) -> Result<LifetimeStatsDocument, DocumentError> {
    let season = parse_season_stats(body)?;
    if season.season_id != LIFETIME_SEASON_ID {
        return Err(DocumentError::Invalid(format!(
            "expected lifetime stats, got season {}",
            season.season_id
        )));
    }
    Ok(LifetimeStatsDocument {
        player_id: season.player_id,
        game_modes: season.game_modes,
    })
}
