//! Victron VRM portal API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info, instrument};

use super::{check_status, history_window, sort_points, trim_base, Inverter, InverterError};
use crate::domain::{GenerationPoint, InverterType};

pub struct VictronClient {
    client: Client,
    base_url: String,
    username: String,
    password: String,
}

#[derive(Serialize)]
struct Login<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Session {
    token: String,
    id_user: i64,
}

#[derive(Debug, Deserialize)]
struct Installations {
    records: Vec<Installation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Installation {
    id_site: i64,
}

#[derive(Debug, Deserialize)]
struct Stats {
    records: StatsRecords,
}

#[derive(Debug, Deserialize)]
struct StatsRecords {
    /// `[epoch ms, value]` pairs
    #[serde(default, deserialize_with = "series_or_false")]
    kwh: Vec<(f64, f64)>,
}

/// VRM sends `false` instead of an empty series
fn series_or_false<'de, D>(deserializer: D) -> Result<Vec<(f64, f64)>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Series {
        Points(Vec<(f64, f64)>),
        Flag(bool),
    }

    match Option::<Series>::deserialize(deserializer)? {
        Some(Series::Points(points)) => Ok(points),
        Some(Series::Flag(false)) | None => Ok(Vec::new()),
        Some(Series::Flag(true)) => Err(serde::de::Error::custom("unexpected `true` for a stats series")),
    }
}

impl VictronClient {
    pub fn new(client: Client, base_url: &str, username: String, password: String) -> Self {
        Self { client, base_url: trim_base(base_url), username, password }
    }

    async fn login(&self) -> Result<Session, InverterError> {
        let response = self
            .client
            .post(format!("{}/v2/auth/login", self.base_url))
            .json(&Login { username: &self.username, password: &self.password })
            .send()
            .await?;
        check_status(InverterType::Victron, response)
            .await?
            .json()
            .await
            .map_err(|e| InverterError::parse(InverterType::Victron, e))
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        token: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, InverterError> {
        let url = format!("{}{path}", self.base_url);
        debug!(%url, "VRM request");
        let response = self
            .client
            .get(url)
            .query(query)
            .header("X-Authorization", format!("Bearer {token}"))
            .send()
            .await?;
        check_status(InverterType::Victron, response)
            .await?
            .json()
            .await
            .map_err(|e| InverterError::parse(InverterType::Victron, e))
    }
}

#[async_trait]
impl Inverter for VictronClient {
    fn vendor(&self) -> InverterType {
        InverterType::Victron
    }

    #[instrument(skip_all)]
    async fn get_data(&self, ts: DateTime<Utc>) -> Result<Vec<GenerationPoint>, InverterError> {
        let session = self.login().await?;
        let installations: Installations = self
            .get(&session.token, &format!("/v2/users/{}/installations", session.id_user), &[])
            .await?;
        // First installation on the account
        let site = installations
            .records
            .first()
            .ok_or_else(|| InverterError::parse(InverterType::Victron, "no installations"))?
            .id_site;

        let start = ts - history_window();
        let stats: Stats = self
            .get(
                &session.token,
                &format!("/v2/installations/{site}/stats"),
                &[
                    ("type", "kwh".to_string()),
                    ("start", start.timestamp().to_string()),
                    ("end", ts.timestamp().to_string()),
                    ("interval", "15mins".to_string()),
                ],
            )
            .await?;

        let points: Vec<GenerationPoint> = stats
            .records
            .kwh
            .into_iter()
            .filter_map(|(ms, value)| {
                DateTime::from_timestamp_millis(ms as i64).map(|t| GenerationPoint::new(t, value))
            })
            .collect();
        info!(site, samples = points.len(), "fetched VRM stats");
        Ok(sort_points(points))
    }
}
