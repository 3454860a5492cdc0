use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::features::{tabular_features, FeatureBuilder};
use super::history::PvHistory;
use super::nwp::fetch_with_fallback;
use super::weather::WeatherProvider;
use crate::config::Config;
use crate::domain::{
    floor_to_quarter_hour, ForecastPoint, ForecastSeries, GenerationPoint, ModelKind, NwpSource, PvSite,
};
use crate::inverters::Inverter;
use crate::ml::{HorizonRegressor, ModelRegistry, PvModel, TabularRegressor};

/// Days of NWP requested from the forecast date onwards
const NWP_WINDOW_DAYS: i64 = 7;

/// Forecast with and without the site's live generation
#[derive(Debug, Clone, PartialEq)]
pub struct LiveForecast {
    pub timestamp: DateTime<Utc>,
    pub power_kw: ForecastSeries,
    /// Only present when the site has an inverter configured
    pub power_kw_no_live_pv: Option<ForecastSeries>,
}

#[derive(Clone)]
pub struct ForecastEngine {
    weather: Arc<dyn WeatherProvider>,
    models: ModelRegistry,
    default_model: ModelKind,
    default_source: NwpSource,
    history_days: i64,
}

impl ForecastEngine {
    pub fn new(weather: Arc<dyn WeatherProvider>, models: ModelRegistry, cfg: &Config) -> Self {
        Self {
            weather,
            models,
            default_model: cfg.models.default_model,
            default_source: cfg.forecast.default_nwp_source,
            history_days: cfg.forecast.history_days,
        }
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    /// Predicted kW every 15 minutes for 48 hours from `ts` (floored to the
    /// quarter hour; now when absent).
    #[instrument(skip(self, site, live), fields(lat = site.latitude, lon = site.longitude))]
    pub async fn run_forecast(
        &self,
        site: &PvSite,
        ts: Option<DateTime<Utc>>,
        model: Option<ModelKind>,
        nwp_source: Option<NwpSource>,
        live: Option<&[GenerationPoint]>,
    ) -> Result<ForecastSeries> {
        let ts = floor_to_quarter_hour(ts.unwrap_or_else(Utc::now));
        let kind = model.unwrap_or(self.default_model);
        let source = nwp_source.unwrap_or(self.default_source);

        let series = match self.models.get(kind).await?.as_ref() {
            PvModel::Horizon(model) => self.run_gb(model, site, ts, source, live).await?,
            PvModel::Tabular(model) => self.run_xgb(model, site, ts).await?,
        };
        info!(%kind, %source, points = series.len(), total_kw = series.total_kw(), "forecast ready");
        Ok(series)
    }

    async fn run_gb(
        &self,
        model: &HorizonRegressor,
        site: &PvSite,
        ts: DateTime<Utc>,
        source: NwpSource,
        live: Option<&[GenerationPoint]>,
    ) -> Result<ForecastSeries> {
        let builder = FeatureBuilder::new(model.feature_config().clone())?;
        let start = ts.date_naive();
        let end = start + Duration::days(NWP_WINDOW_DAYS);
        let frame = fetch_with_fallback(self.weather.as_ref(), source, site.latitude, site.longitude, start, end)
            .await
            .with_context(|| format!("fetching {source} NWP from {start} to {end}"))?;
        let nwp = BTreeMap::from([(source, vec![frame])]);

        let history = match live {
            Some(points) => PvHistory::new(points.to_vec())
                .clipped(ts - Duration::days(self.history_days), ts),
            None => PvHistory::empty(),
        };

        let table = builder.build(site, ts, &history, &nwp)?;
        let predictions = model.predict(&table)?;
        let starts = builder.config().horizons.starts(ts);
        Ok(series(ts, starts.into_iter().zip(predictions)))
    }

    async fn run_xgb(&self, model: &TabularRegressor, site: &PvSite, ts: DateTime<Utc>) -> Result<ForecastSeries> {
        let span = Duration::hours(48);
        let start = ts.date_naive();
        let end = (ts + span).date_naive();
        let weather = self
            .weather
            .tabular(site.latitude, site.longitude, start, end)
            .await
            .with_context(|| format!("fetching weather from {start} to {end}"))?;

        let table = tabular_features(site, &weather)?;
        let predictions = model.predict(&table)?;
        let rows = weather
            .times
            .iter()
            .copied()
            .zip(predictions)
            .filter(|(t, _)| *t >= ts && *t < ts + span);
        Ok(series(ts, rows))
    }

    /// Forecast using the site's live generation when it has an inverter.
    ///
    /// A failing inverter is logged and the forecast runs without live data.
    pub async fn forecast_with_live(
        &self,
        site: &PvSite,
        ts: Option<DateTime<Utc>>,
        model: Option<ModelKind>,
        nwp_source: Option<NwpSource>,
        inverter: Option<&dyn Inverter>,
    ) -> Result<LiveForecast> {
        let timestamp = floor_to_quarter_hour(ts.unwrap_or_else(Utc::now));
        let Some(inverter) = inverter else {
            let power_kw = self.run_forecast(site, Some(timestamp), model, nwp_source, None).await?;
            return Ok(LiveForecast { timestamp, power_kw, power_kw_no_live_pv: None });
        };

        let live = match inverter.get_data(timestamp).await {
            Ok(points) => points,
            Err(err) => {
                warn!(vendor = %inverter.vendor(), error = %err, "no live data, forecasting without it");
                Vec::new()
            }
        };

        let without = self.run_forecast(site, Some(timestamp), model, nwp_source, None).await?;
        let with = if live.is_empty() {
            warn!(vendor = %inverter.vendor(), "inverter returned no samples");
            without.clone()
        } else {
            info!(vendor = %inverter.vendor(), samples = live.len(), "using live generation");
            self.run_forecast(site, Some(timestamp), model, nwp_source, Some(&live)).await?
        };
        Ok(LiveForecast { timestamp, power_kw: with, power_kw_no_live_pv: Some(without) })
    }
}

/// Negative (and NaN) predictions become zero
fn series(init_time: DateTime<Utc>, rows: impl Iterator<Item = (DateTime<Utc>, f64)>) -> ForecastSeries {
    let points = rows
        .map(|(timestamp, kw)| ForecastPoint { timestamp, power_kw: kw.max(0.0) })
        .collect();
    ForecastSeries::new(init_time, points)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::forecast::features::FeatureConfig;
    use crate::forecast::weather::{MockWeatherProvider, NwpFrame, WeatherTable, NWP_VARIABLES, TABULAR_VARIABLES};
    use crate::inverters::{InverterError, MockInverter, StaticInverter};
    use crate::ml::ModelArtifact;
    use chrono::TimeZone;
    use figment::{providers::{Format, Toml}, Figment};
    use serde_json::json;

    pub(crate) fn config() -> Config {
        Config::from_figment(Figment::new().merge(Toml::string(include_str!("../../config/default.toml")))).unwrap()
    }

    /// gb model over the default feature set. Targets are kW per kWp per
    /// W/m² of clear-sky POA; the leaf jumps once recent power shows output.
    pub(crate) fn gb_model() -> PvModel {
        let builder = FeatureBuilder::new(FeatureConfig::default()).unwrap();
        let mut names = builder.feature_names(&[NwpSource::Icon]).unwrap();
        names.push("horizon_idx".to_string());
        let recent = names.iter().position(|n| n == "recent_power").unwrap();
        let doc = json!({
            "kind": "gb",
            "version": "test",
            "booster": { "learner": {
                "feature_names": names,
                "learner_model_param": { "base_score": "0E0" },
                "objective": { "name": "reg:squarederror" },
                "gradient_booster": { "model": { "trees": [{
                    "left_children": [1, -1, -1],
                    "right_children": [2, -1, -1],
                    "split_indices": [recent, 0, 0],
                    "split_conditions": [1e-4, 5e-4, 8e-4],
                    "default_left": [1, 0, 0]
                }] } }
            } }
        });
        serde_json::from_value::<ModelArtifact>(doc).unwrap().into_model().unwrap()
    }

    /// xgb model predicting `kwp` minus one, so night and day look the same
    fn xgb_model() -> PvModel {
        let doc = json!({
            "kind": "xgb",
            "version": "test",
            "booster": { "learner": {
                "feature_names": ["kwp", "hour"],
                "learner_model_param": { "base_score": "[-1E0]" },
                "gradient_booster": { "model": { "trees": [{
                    "left_children": [1, -1, -1],
                    "right_children": [2, -1, -1],
                    "split_indices": [0, 0, 0],
                    "split_conditions": [3.0, 0.5, 4.0],
                    "default_left": [0, 0, 0]
                }] } }
            } }
        });
        serde_json::from_value::<ModelArtifact>(doc).unwrap().into_model().unwrap()
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 10, 10, 7, 0).unwrap()
    }

    fn icon_frame() -> NwpFrame {
        let init = ts().date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc();
        let times: Vec<_> = (0..24 * 8).map(|h| init + Duration::hours(h)).collect();
        let variables = NWP_VARIABLES
            .iter()
            .map(|(_, key)| (key.to_string(), vec![1.0; times.len()]))
            .collect();
        NwpFrame { source: NwpSource::Icon, init_time: init, times, variables }
    }

    async fn engine(model: PvModel, weather: MockWeatherProvider) -> ForecastEngine {
        let registry = ModelRegistry::new();
        registry.register(model).await;
        ForecastEngine::new(Arc::new(weather), registry, &config())
    }

    fn icon_weather() -> MockWeatherProvider {
        let mut weather = MockWeatherProvider::new();
        weather
            .expect_nwp()
            .withf(|source, _, _, start, end| {
                *source == NwpSource::Icon
                    && *start == ts().date_naive()
                    && *end == ts().date_naive() + Duration::days(7)
            })
            .returning(|_, _, _, _, _| Ok(icon_frame()));
        weather
    }

    #[tokio::test]
    async fn test_gb_forecast_shape() {
        let engine = engine(gb_model(), icon_weather()).await;
        let site = PvSite::new(51.75, -1.25, 4.0);
        let series = engine.run_forecast(&site, Some(ts()), None, None, None).await.unwrap();

        assert_eq!(series.len(), 192);
        assert_eq!(series.init_time, Utc.with_ymd_and_hms(2024, 6, 10, 10, 0, 0).unwrap());
        assert_eq!(series.points[0].timestamp, series.init_time);
        assert_eq!(series.points[191].timestamp, series.init_time + Duration::minutes(191 * 15));
        assert!(series.points.iter().all(|p| p.power_kw >= 0.0));
        // No live data: the low leaf, scaled back by capacity and POA
        let poa = crate::solar::poa_global(&site, series.init_time + Duration::seconds(450));
        approx::assert_abs_diff_eq!(series.points[0].power_kw, 5e-4 * 4.0 * poa, epsilon = 1e-9);
    }

    #[tokio::test]
    async fn test_unloaded_model_is_reported() {
        let engine = engine(gb_model(), MockWeatherProvider::new()).await;
        let site = PvSite::new(51.75, -1.25, 4.0);
        let err = engine.run_forecast(&site, Some(ts()), Some(ModelKind::Xgb), None, None).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::ml::ModelError>(),
            Some(crate::ml::ModelError::NotLoaded(ModelKind::Xgb))
        ));
    }

    #[tokio::test]
    async fn test_xgb_keeps_48_hours_from_ts() {
        let mut weather = MockWeatherProvider::new();
        weather.expect_tabular().returning(|_, _, start, end| {
            assert_eq!(end, start + Duration::days(2));
            let t0 = start.and_hms_opt(0, 0, 0).unwrap().and_utc();
            let times: Vec<_> = (0..96 * 3).map(|i| t0 + Duration::minutes(15 * i)).collect();
            let columns = TABULAR_VARIABLES
                .iter()
                .map(|name| (name.to_string(), vec![0.0; times.len()]))
                .collect();
            Ok(WeatherTable { times, columns })
        });
        let engine = engine(xgb_model(), weather).await;
        let site = PvSite::new(51.75, -1.25, 3.5);

        let series = engine.run_forecast(&site, Some(ts()), Some(ModelKind::Xgb), None, None).await.unwrap();
        assert_eq!(series.len(), 192);
        assert_eq!(series.points[0].timestamp, Utc.with_ymd_and_hms(2024, 6, 10, 10, 0, 0).unwrap());
        // kwp 3.5 -> leaf 4.0, plus base score -1
        approx::assert_abs_diff_eq!(series.points[5].power_kw, 3.0);
    }

    #[tokio::test]
    async fn test_live_data_changes_forecast() {
        let engine = engine(gb_model(), icon_weather()).await;
        let site = PvSite::new(51.75, -1.25, 4.0);
        // Plenty of recent generation pushes recent_power over the split
        let live: Vec<_> = (1..=4)
            .map(|i| GenerationPoint::new(ts() - Duration::minutes(7 * i), 3.5))
            .collect();
        let inverter = StaticInverter::new(live);

        let forecast = engine
            .forecast_with_live(&site, Some(ts()), None, None, Some(&inverter))
            .await
            .unwrap();
        let without = forecast.power_kw_no_live_pv.unwrap();
        assert!(forecast.power_kw.points[0].power_kw > without.points[0].power_kw);
    }

    #[tokio::test]
    async fn test_failing_inverter_gives_identical_series() {
        let engine = engine(gb_model(), icon_weather()).await;
        let site = PvSite::new(51.75, -1.25, 4.0);
        let mut inverter = MockInverter::new();
        inverter.expect_vendor().return_const(crate::domain::InverterType::Enphase);
        inverter
            .expect_get_data()
            .returning(|_| Err(InverterError::MissingCredential("ENPHASE_API_KEY")));

        let forecast = engine
            .forecast_with_live(&site, Some(ts()), None, None, Some(&inverter))
            .await
            .unwrap();
        assert_eq!(Some(forecast.power_kw), forecast.power_kw_no_live_pv);
    }

    #[tokio::test]
    async fn test_without_inverter_only_one_series() {
        let engine = engine(gb_model(), icon_weather()).await;
        let site = PvSite::new(51.75, -1.25, 4.0);
        let forecast = engine.forecast_with_live(&site, Some(ts()), None, None, None).await.unwrap();
        assert!(forecast.power_kw_no_live_pv.is_none());
        assert_eq!(forecast.timestamp, Utc.with_ymd_and_hms(2024, 6, 10, 10, 0, 0).unwrap());
    }
}
