//! Upstream API contract, typed documents and the HTTP client implementing them.

pub mod documents;

use async_trait::async_trait;
use chrono::Utc;
use pubgsync_core::{Season, LIFETIME_SEASON_ID};
use pubgsync_storage::{ArtifactStore, FetchError, HttpFetcher, QuotaSnapshot, ResponseClass};
use thiserror::Error;
use tracing::{debug, warn};

pub use documents::{
    DocumentError, LifetimeStatsDocument, MatchDocument, Participant, PlayerDocument,
    RankedStatsDocument, SeasonStatsDocument,
};

pub const CRATE_NAME: &str = "pubgsync-adapters";

/// The player lookup endpoint accepts at most this many names per call.
pub const MAX_PLAYER_NAMES_PER_CALL: usize = 10;

pub const JSON_API_MEDIA_TYPE: &str = "application/vnd.api+json";

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("quota exceeded fetching {resource}")]
    QuotaExceeded {
        resource: String,
        quota: Option<QuotaSnapshot>,
    },
    #[error("request for {resource} failed: {source}")]
    Request {
        resource: String,
        #[source]
        source: FetchError,
    },
    #[error("{resource} answered http {status}")]
    Status { resource: String, status: u16 },
    #[error("malformed {resource} document: {source}")]
    Malformed {
        resource: String,
        #[source]
        source: DocumentError,
    },
}

impl UpstreamError {
    pub fn resource(&self) -> &str {
        match self {
            Self::QuotaExceeded { resource, .. }
            | Self::Request { resource, .. }
            | Self::Status { resource, .. }
            | Self::Malformed { resource, .. } => resource,
        }
    }
}

/// A parsed document plus the rate-limit metadata of the response that carried it.
#[derive(Debug, Clone)]
pub struct ApiResponse<T> {
    pub body: T,
    pub quota: Option<QuotaSnapshot>,
}

impl<T> ApiResponse<T> {
    pub fn new(body: T) -> Self {
        Self { body, quota: None }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ApiResponse<U> {
        ApiResponse {
            body: f(self.body),
            quota: self.quota,
        }
    }
}

/// Read-only view of the upstream resources the sync pipeline consumes.
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    async fn players_by_name(
        &self,
        names: &[String],
    ) -> Result<ApiResponse<Vec<PlayerDocument>>, UpstreamError>;

    async fn seasons(&self) -> Result<ApiResponse<Vec<Season>>, UpstreamError>;

    async fn match_by_id(&self, match_id: &str) -> Result<ApiResponse<MatchDocument>, UpstreamError>;

    async fn season_stats(
        &self,
        player_id: &str,
        season_id: &str,
    ) -> Result<ApiResponse<SeasonStatsDocument>, UpstreamError>;

    async fn ranked_season_stats(
        &self,
        player_id: &str,
        season_id: &str,
    ) -> Result<ApiResponse<RankedStatsDocument>, UpstreamError>;

    async fn lifetime_stats(
        &self,
        player_id: &str,
    ) -> Result<ApiResponse<LifetimeStatsDocument>, UpstreamError>;
}

/// Split tracked names into lookup batches, dropping blanks and duplicates.
pub fn player_name_batches(names: &[String]) -> Vec<Vec<String>> {
    let mut unique: Vec<String> = Vec::new();
    for name in names {
        let name = name.trim();
        if !name.is_empty() && !unique.iter().any(|n| n == name) {
            unique.push(name.to_string());
        }
    }
    unique
        .chunks(MAX_PLAYER_NAMES_PER_CALL)
        .map(<[String]>::to_vec)
        .collect()
}

pub struct PubgApiClient {
    http: HttpFetcher,
    shard_url: String,
    archive: Option<ArtifactStore>,
}

impl PubgApiClient {
    pub fn new(http: HttpFetcher, api_base_url: &str, shard: &str) -> Self {
        Self {
            http,
            shard_url: format!("{}/shards/{}", api_base_url.trim_end_matches('/'), shard),
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: ArtifactStore) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn shard_url(&self) -> &str {
        &self.shard_url
    }

    async fn get_document<T>(
        &self,
        resource: &str,
        query: &[(&str, &str)],
        parse: impl FnOnce(&[u8]) -> Result<T, DocumentError>,
    ) -> Result<ApiResponse<T>, UpstreamError> {
        let url = format!("{}{}", self.shard_url, resource);
        let resp = self
            .http
            .get(resource, &url, query)
            .await
            .map_err(|source| UpstreamError::Request {
                resource: resource.to_string(),
                source,
            })?;
        let quota = resp.quota();

        match resp.class() {
            ResponseClass::QuotaExceeded => {
                return Err(UpstreamError::QuotaExceeded {
                    resource: resource.to_string(),
                    quota,
                })
            }
            ResponseClass::Failed => {
                return Err(UpstreamError::Status {
                    resource: resource.to_string(),
                    status: resp.status.as_u16(),
                })
            }
            ResponseClass::Success => {}
        }

        if let Some(archive) = &self.archive {
            match archive.store_response(Utc::now(), resource, &resp.body).await {
                Ok(stored) => debug!(resource, path = %stored.relative_path.display(), "archived response"),
                Err(err) => warn!(resource, error = %err, "failed to archive response"),
            }
        }

        let body = parse(&resp.body).map_err(|source| UpstreamError::Malformed {
            resource: resource.to_string(),
            source,
        })?;
        Ok(ApiResponse { body, quota })
    }
}

fn expect_key(resource: &str, field: &str, expected: &str, got: &str) -> Result<(), UpstreamError> {
    if expected == got {
        return Ok(());
    }
    Err(UpstreamError::Malformed {
        resource: resource.to_string(),
        source: DocumentError::Invalid(format!("{field} is {got}, requested {expected}")),
    })
}

#[async_trait]
impl UpstreamApi for PubgApiClient {
    async fn players_by_name(
        &self,
        names: &[String],
    ) -> Result<ApiResponse<Vec<PlayerDocument>>, UpstreamError> {
        let filter = names.join(",");
        self.get_document(
            "/players",
            &[("filter[playerNames]", filter.as_str())],
            documents::parse_players,
        )
        .await
    }

    async fn seasons(&self) -> Result<ApiResponse<Vec<Season>>, UpstreamError> {
        self.get_document("/seasons", &[], documents::parse_seasons)
            .await
    }

    async fn match_by_id(&self, match_id: &str) -> Result<ApiResponse<MatchDocument>, UpstreamError> {
        let resource = format!("/matches/{match_id}");
        let resp = self
            .get_document(&resource, &[], documents::parse_match)
            .await?;
        expect_key(&resource, "match id", match_id, &resp.body.record.match_id)?;
        Ok(resp)
    }

    async fn season_stats(
        &self,
        player_id: &str,
        season_id: &str,
    ) -> Result<ApiResponse<SeasonStatsDocument>, UpstreamError> {
        let resource = format!("/players/{player_id}/seasons/{season_id}");
        let resp = self
            .get_document(&resource, &[], documents::parse_season_stats)
            .await?;
        expect_key(&resource, "player id", player_id, &resp.body.player_id)?;
        expect_key(&resource, "season id", season_id, &resp.body.season_id)?;
        Ok(resp)
    }

    async fn ranked_season_stats(
        &self,
        player_id: &str,
        season_id: &str,
    ) -> Result<ApiResponse<RankedStatsDocument>, UpstreamError> {
        let resource = format!("/players/{player_id}/seasons/{season_id}/ranked");
        let resp = self
            .get_document(&resource, &[], documents::parse_ranked_stats)
            .await?;
        expect_key(&resource, "player id", player_id, &resp.body.player_id)?;
        expect_key(&resource, "season id", season_id, &resp.body.season_id)?;
        Ok(resp)
    }

    async fn lifetime_stats(
        &self,
        player_id: &str,
    ) -> Result<ApiResponse<LifetimeStatsDocument>, UpstreamError> {
        let resource = format!("/players/{player_id}/seasons/{LIFETIME_SEASON_ID}");
        let resp = self
            .get_document(&resource, &[], documents::parse_lifetime_stats)
            .await?;
        expect_key(&resource, "player id", player_id, &resp.body.player_id)?;
        Ok(resp)
    }
}
