//! SolisCloud platform API.
//!
//! Every call is a signed POST: the body's MD5, the date and the resource
//! path are HMAC-SHA1 signed with the account secret.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{Client, StatusCode};
use ring::hmac;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::{history_window, sort_points, trim_base, Inverter, InverterError};
use crate::domain::{GenerationPoint, InverterType};

const INVERTER_LIST: &str = "/v1/api/inverterList";
const INVERTER_DAY: &str = "/v1/api/inverterDay";
const CONTENT_TYPE: &str = "application/json";
/// The platform allows two requests per second
const DEFAULT_SPACING: Duration = Duration::from_millis(500);

pub struct SolisClient {
    client: Client,
    base_url: String,
    key_id: String,
    secret: String,
    spacing: Duration,
}

#[derive(Debug, Clone, PartialEq)]
struct SignedHeaders {
    content_md5: String,
    date: String,
    authorization: String,
}

fn sign(key_id: &str, secret: &str, body: &str, resource: &str, now: DateTime<Utc>) -> SignedHeaders {
    let content_md5 = STANDARD.encode(md5::compute(body.as_bytes()).0);
    let date = now.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    let to_sign = format!("POST\n{content_md5}\n{CONTENT_TYPE}\n{date}\n{resource}");
    let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, secret.as_bytes());
    let signature = STANDARD.encode(hmac::sign(&key, to_sign.as_bytes()).as_ref());
    SignedHeaders { content_md5, date, authorization: format!("API {key_id}:{signature}") }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    code: Value,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Value,
}

#[derive(Serialize)]
struct InverterListRequest {
    #[serde(rename = "pageNo")]
    page_no: u32,
    #[serde(rename = "pageSize")]
    page_size: u32,
}

#[derive(Serialize)]
struct InverterDayRequest<'a> {
    money: &'a str,
    time: String,
    #[serde(rename = "timeZone")]
    time_zone: i32,
    sn: &'a str,
}

#[derive(Debug, Deserialize)]
struct InverterPage {
    page: Records,
}

#[derive(Debug, Deserialize)]
struct Records {
    records: Vec<InverterRecord>,
}

#[derive(Debug, Deserialize)]
struct InverterRecord {
    sn: String,
}

/// Numbers arrive either as JSON numbers or as strings
fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// `inverterDay` returns either `{ "energyList": [...] }` or a bare list
fn day_samples(data: &Value, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<GenerationPoint> {
    let items = match data {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => map
            .get("energyList")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default(),
        _ => &[],
    };
    items
        .iter()
        .filter_map(|item| {
            let time = number(item.get("time"))? as i64;
            let watts = number(item.get("power")).or_else(|| number(item.get("pac")))?;
            let ts = DateTime::from_timestamp(time, 0)?;
            (start <= ts && ts <= end).then(|| GenerationPoint::new(ts, watts / 1000.0))
        })
        .collect()
}

impl SolisClient {
    /// `base_url` includes the API port, e.g. `https://www.soliscloud.com:13333`
    pub fn new(client: Client, base_url: &str, key_id: String, secret: String) -> Self {
        Self { client, base_url: trim_base(base_url), key_id, secret, spacing: DEFAULT_SPACING }
    }

    pub fn with_spacing(mut self, spacing: Duration) -> Self {
        self.spacing = spacing;
        self
    }

    #[instrument(skip_all, level = "debug", fields(resource = resource))]
    async fn call<B: Serialize, R: DeserializeOwned>(&self, resource: &str, body: &B) -> Result<R, InverterError> {
        let body = serde_json::to_string(body).map_err(|e| InverterError::parse(InverterType::Solis, e))?;
        let now = Utc::now();
        let signed = sign(&self.key_id, &self.secret, &body, resource, now);

        let response = self
            .client
            .post(format!("{}{resource}", self.base_url))
            .header("Content-MD5", signed.content_md5)
            .header("Content-Type", CONTENT_TYPE)
            .header("Date", signed.date)
            .header("Authorization", signed.authorization)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::REQUEST_TIMEOUT {
            return Err(InverterError::ClockSkew { now });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InverterError::Status { vendor: InverterType::Solis, status: status.as_u16(), body });
        }

        let envelope: Envelope =
            response.json().await.map_err(|e| InverterError::parse(InverterType::Solis, e))?;
        let code = match &envelope.code {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if code != "0" {
            return Err(InverterError::Api { message: envelope.msg, code });
        }
        debug!("call succeeded");
        serde_json::from_value(envelope.data).map_err(|e| InverterError::parse(InverterType::Solis, e))
    }

    pub async fn inverter_serials(&self) -> Result<Vec<String>, InverterError> {
        let page: InverterPage = self
            .call(INVERTER_LIST, &InverterListRequest { page_no: 1, page_size: 100 })
            .await?;
        Ok(page.page.records.into_iter().map(|r| r.sn).collect())
    }

    async fn inverter_day(&self, sn: &str, day: String) -> Result<Value, InverterError> {
        self.call(INVERTER_DAY, &InverterDayRequest { money: "USD", time: day, time_zone: 0, sn })
            .await
    }
}

#[async_trait]
impl Inverter for SolisClient {
    fn vendor(&self) -> InverterType {
        InverterType::Solis
    }

    #[instrument(skip_all)]
    async fn get_data(&self, ts: DateTime<Utc>) -> Result<Vec<GenerationPoint>, InverterError> {
        let serials = self.inverter_serials().await?;
        if serials.is_empty() {
            return Err(InverterError::parse(InverterType::Solis, "no inverters found"));
        }

        let start = ts - history_window();
        let mut points = Vec::new();
        for sn in &serials {
            for offset in 0..history_window().num_days() {
                let day = (ts - ChronoDuration::days(offset)).format("%Y-%m-%d").to_string();
                match self.inverter_day(sn, day.clone()).await {
                    Ok(data) => points.extend(day_samples(&data, start, ts)),
                    Err(err) => warn!(inverter = %sn, %day, error = %err, "skipping Solis day"),
                }
                tokio::time::sleep(self.spacing).await;
            }
        }

        info!(inverters = serials.len(), samples = points.len(), "fetched Solis data");
        Ok(sort_points(points))
    }
}
