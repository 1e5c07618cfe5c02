//! Home Assistant REST API client.
//!
//! Thin reqwest wrapper around the two endpoints Hearth needs: the entity
//! state list and the state history for one entity over a time range.
//! Failures are surfaced to the caller as typed [`HaError`]s and never
//! retried here; the frontend owns any user-visible retry.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::model::{EntitySummary, HaEntityState, RawHistoryRecord};

/// Per-request timeout for calls to Home Assistant.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Lookbacks probed (in days) when estimating the available history range.
/// Home Assistant's recorder default retention is 10 days, so the probe
/// starts wide and narrows.
const RANGE_PROBE_DAYS: &[i64] = &[30, 14, 7, 3, 1];

#[derive(Debug, Error)]
pub enum HaError {
    #[error("Authentication failed. Check your API token.")]
    Unauthorized,

    #[error("Cannot connect to Home Assistant at {0}. Check the URL and ensure HA is running.")]
    Connection(String),

    #[error("Request to Home Assistant timed out")]
    Timeout,

    #[error("Home Assistant returned HTTP {0}")]
    Status(u16),

    #[error("Failed to decode Home Assistant response: {0}")]
    Decode(String),
}

/// Client for the Home Assistant REST API.
#[derive(Clone)]
pub struct HaClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HaClient {
    pub fn new(base_url: &str, token: &str) -> Self {
        HaClient {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json<T: DeserializeOwned>(&self, path_and_query: &str) -> Result<T, HaError> {
        // Manual join instead of Url::join: the base URL may carry a path
        // component (the Supervisor proxy exposes HA at /core) that joining
        // an absolute path would discard.
        let url = format!(
            "{}/{}",
            self.base_url,
            path_and_query.trim_start_matches('/')
        );
        debug!(%url, "Requesting from Home Assistant");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status.as_u16() == 401 {
            return Err(HaError::Unauthorized);
        }
        if !status.is_success() {
            return Err(HaError::Status(status.as_u16()));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| HaError::Decode(e.to_string()))
    }

    fn transport_error(&self, err: reqwest::Error) -> HaError {
        if err.is_timeout() {
            HaError::Timeout
        } else if err.is_connect() {
            HaError::Connection(self.base_url.clone())
        } else {
            HaError::Decode(err.to_string())
        }
    }

    /// All entity states from `GET /api/states`.
    pub async fn get_states(&self) -> Result<Vec<HaEntityState>, HaError> {
        self.get_json("/api/states").await
    }

    /// Entity list shaped for the selector, sorted case-insensitively by
    /// friendly name.
    pub async fn entities_summary(&self) -> Result<Vec<EntitySummary>, HaError> {
        let states = self.get_states().await?;
        let mut entities: Vec<EntitySummary> = states
            .into_iter()
            .map(|state| {
                let friendly_name = state
                    .attributes
                    .get("friendly_name")
                    .and_then(|v| v.as_str())
                    .unwrap_or(&state.entity_id)
                    .to_string();
                let icon = state
                    .attributes
                    .get("icon")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                EntitySummary {
                    domain: crate::normalize::entity_domain(&state.entity_id).to_string(),
                    friendly_name,
                    icon,
                    entity_id: state.entity_id,
                    state: state.state,
                }
            })
            .collect();
        entities.sort_by_key(|e| e.friendly_name.to_lowercase());
        Ok(entities)
    }

    /// State history for one entity over `[start, end]`, full attributes
    /// included. The API nests results per entity; a single-entity filter
    /// means the first (only) list is ours. Records arrive sorted ascending.
    pub async fn get_history(
        &self,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawHistoryRecord>, HaError> {
        let path = format!(
            "/api/history/period/{}?filter_entity_id={}&end_time={}&minimal_response=false&significant_changes_only=false",
            urlencoding::encode(&start.to_rfc3339()),
            urlencoding::encode(entity_id),
            urlencoding::encode(&end.to_rfc3339()),
        );
        let mut nested: Vec<Vec<RawHistoryRecord>> = self.get_json(&path).await?;
        Ok(if nested.is_empty() {
            Vec::new()
        } else {
            nested.swap_remove(0)
        })
    }

    /// Estimate the available history range for an entity by probing
    /// progressively shorter lookbacks for the earliest record.
    pub async fn history_range(
        &self,
        entity_id: &str,
    ) -> Result<(Option<String>, DateTime<Utc>), HaError> {
        let now = Utc::now();
        for days in RANGE_PROBE_DAYS {
            let probe_start = now - chrono::Duration::days(*days);
            let probe_end = probe_start + chrono::Duration::hours(1);
            let history = self.get_history(entity_id, probe_start, probe_end).await?;
            if let Some(earliest) = history.first().and_then(|r| r.timestamp()) {
                return Ok((Some(earliest.to_string()), now));
            }
        }
        Ok((None, now))
    }
}
