//! Picking NWP values for a forecast.
//!
//! A forecast made at `now` may only look at runs initialised at or before
//! `now`. Within the chosen run every horizon takes the nearest valid time.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

use super::features::FeatureError;
use super::weather::{NwpFrame, WeatherError, WeatherProvider, NWP_VARIABLES};
use crate::domain::NwpSource;

/// Choose the run to use at `now`: the latest one initialised at or before
/// `now`, as long as it is not older than `tolerance`.
pub fn latest_run<'a>(
    runs: &'a [NwpFrame],
    now: DateTime<Utc>,
    tolerance: Option<Duration>,
) -> Option<&'a NwpFrame> {
    runs.iter()
        .filter(|run| run.init_time <= now)
        .max_by_key(|run| run.init_time)
        .filter(|run| tolerance.map_or(true, |tol| now - run.init_time <= tol))
}

/// Values of every NWP variable at each timestamp.
///
/// Returns `Ok(None)` when no run qualifies; callers treat that as "all
/// NaN" rather than as an error.
pub fn select_nwp(
    runs: &[NwpFrame],
    now: DateTime<Utc>,
    tolerance: Option<Duration>,
    timestamps: &[DateTime<Utc>],
) -> Result<Option<BTreeMap<String, Vec<f64>>>, FeatureError> {
    if let Some(ts) = timestamps.iter().find(|ts| **ts < now) {
        return Err(FeatureError::TimestampBeforeNow { ts: *ts, now });
    }

    let Some(run) = latest_run(runs, now, tolerance) else {
        return Ok(None);
    };

    let indices: Vec<Option<usize>> = timestamps.iter().map(|ts| run.nearest_index(*ts)).collect();
    let selected = run
        .variables
        .iter()
        .map(|(key, values)| {
            let picked = indices
                .iter()
                .map(|idx| idx.and_then(|i| values.get(i).copied()).unwrap_or(f64::NAN))
                .collect();
            (key.clone(), picked)
        })
        .collect();
    Ok(Some(selected))
}

/// Fill NaNs in `primary` from `fallback` at identical valid times.
///
/// Returns how many values were filled.
pub fn merge_fallback(primary: &mut NwpFrame, fallback: &NwpFrame) -> usize {
    let by_time: HashMap<DateTime<Utc>, usize> =
        fallback.times.iter().enumerate().map(|(i, t)| (*t, i)).collect();

    let mut filled = 0;
    for (key, values) in primary.variables.iter_mut() {
        let Some(backup) = fallback.variables.get(key) else {
            continue;
        };
        for (value, ts) in values.iter_mut().zip(&primary.times) {
            if value.is_finite() {
                continue;
            }
            if let Some(v) = by_time.get(ts).and_then(|i| backup.get(*i)).filter(|v| v.is_finite()) {
                *value = *v;
                filled += 1;
            }
        }
    }
    filled
}

/// Fetch a provider's NWP and patch it up from GFS.
///
/// Variables the provider does not publish (ICON has no visibility, for
/// instance) are filled from GFS. If the provider fails outright, GFS is
/// used instead.
pub async fn fetch_with_fallback(
    weather: &dyn WeatherProvider,
    source: NwpSource,
    latitude: f64,
    longitude: f64,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<NwpFrame, WeatherError> {
    let primary = weather.nwp(source, latitude, longitude, start, end).await;
    if source == NwpSource::Gfs {
        return primary;
    }

    let mut frame = match primary {
        Ok(frame) => frame,
        Err(err) => {
            warn!(%source, error = %err, "NWP provider failed, falling back to gfs");
            return weather.nwp(NwpSource::Gfs, latitude, longitude, start, end).await;
        }
    };

    let missing: Vec<&str> = NWP_VARIABLES
        .iter()
        .map(|(_, key)| *key)
        .filter(|key| frame.is_missing(key))
        .collect();
    if missing.is_empty() {
        return Ok(frame);
    }

    match weather.nwp(NwpSource::Gfs, latitude, longitude, start, end).await {
        Ok(gfs) => {
            let filled = merge_fallback(&mut frame, &gfs);
            info!(%source, ?missing, filled, "filled missing NWP variables from gfs");
        }
        Err(err) => warn!(%source, ?missing, error = %err, "gfs fallback unavailable"),
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forecast::weather::MockWeatherProvider;
    use chrono::TimeZone;

    fn frame(source: NwpSource, init: DateTime<Utc>, vis: Vec<f64>, t: Vec<f64>) -> NwpFrame {
        let times = (0..vis.len() as i64).map(|h| init + Duration::hours(h)).collect();
        let mut variables = BTreeMap::new();
        variables.insert("vis".to_string(), vis);
        variables.insert("t".to_string(), t);
        NwpFrame { source, init_time: init, times, variables }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_latest_run_ignores_future_runs() {
        let runs = vec![
            frame(NwpSource::Icon, t0(), vec![1.0], vec![1.0]),
            frame(NwpSource::Icon, t0() + Duration::hours(6), vec![2.0], vec![2.0]),
            frame(NwpSource::Icon, t0() + Duration::hours(12), vec![3.0], vec![3.0]),
        ];
        let now = t0() + Duration::hours(7);
        let run = latest_run(&runs, now, None).unwrap();
        assert_eq!(run.init_time, t0() + Duration::hours(6));
    }

    #[test]
    fn test_latest_run_respects_tolerance() {
        let runs = vec![frame(NwpSource::Icon, t0(), vec![1.0], vec![1.0])];
        let now = t0() + Duration::hours(10);
        assert!(latest_run(&runs, now, Some(Duration::hours(6))).is_none());
        assert!(latest_run(&runs, now, Some(Duration::hours(12))).is_some());
    }

    #[test]
    fn test_select_nearest_step() {
        let runs = vec![frame(
            NwpSource::Gfs,
            t0(),
            vec![10.0, 20.0, 30.0, 40.0],
            vec![1.0, 2.0, 3.0, 4.0],
        )];
        let now = t0() + Duration::minutes(30);
        let timestamps = vec![
            now + Duration::minutes(7),  // 00:37 -> 01:00
            now + Duration::minutes(65), // 01:35 -> 02:00
            now + Duration::hours(10),   // past the end -> last step
        ];
        let selected = select_nwp(&runs, now, None, &timestamps).unwrap().unwrap();
        assert_eq!(selected["t"], vec![2.0, 3.0, 4.0]);
        assert_eq!(selected["vis"], vec![20.0, 30.0, 40.0]);
    }

    #[test]
    fn test_select_without_usable_run_is_none() {
        let runs = vec![frame(NwpSource::Gfs, t0() + Duration::days(1), vec![1.0], vec![1.0])];
        let selected = select_nwp(&runs, t0(), None, &[t0() + Duration::hours(1)]).unwrap();
        assert!(selected.is_none());
    }

    #[test]
    fn test_select_rejects_timestamps_in_the_past() {
        let runs = vec![frame(NwpSource::Gfs, t0(), vec![1.0], vec![1.0])];
        let now = t0() + Duration::hours(2);
        let err = select_nwp(&runs, now, None, &[now - Duration::minutes(15)]).unwrap_err();
        assert!(matches!(err, FeatureError::TimestampBeforeNow { .. }));
    }

    #[test]
    fn test_merge_fallback_only_fills_nan() {
        let mut icon = frame(NwpSource::Icon, t0(), vec![f64::NAN, f64::NAN], vec![5.0, f64::NAN]);
        let gfs = frame(NwpSource::Gfs, t0(), vec![9000.0, 8000.0], vec![7.0, 6.0]);
        let filled = merge_fallback(&mut icon, &gfs);
        assert_eq!(filled, 3);
        assert_eq!(icon.variables["vis"], vec![9000.0, 8000.0]);
        assert_eq!(icon.variables["t"], vec![5.0, 6.0]);
        assert_eq!(icon.source, NwpSource::Icon);
    }

    #[tokio::test]
    async fn test_icon_visibility_comes_from_gfs() {
        let mut weather = MockWeatherProvider::new();
        weather
            .expect_nwp()
            .withf(|source, _, _, _, _| *source == NwpSource::Icon)
            .times(1)
            .returning(|_, _, _, _, _| {
                Ok(frame(NwpSource::Icon, t0(), vec![f64::NAN, f64::NAN], vec![5.0, 6.0]))
            });
        weather
            .expect_nwp()
            .withf(|source, _, _, _, _| *source == NwpSource::Gfs)
            .times(1)
            .returning(|_, _, _, _, _| {
                Ok(frame(NwpSource::Gfs, t0(), vec![9000.0, 9100.0], vec![4.0, 4.0]))
            });

        let day = t0().date_naive();
        let merged = fetch_with_fallback(&weather, NwpSource::Icon, 51.5, -1.25, day, day)
            .await
            .unwrap();
        assert_eq!(merged.variables["vis"], vec![9000.0, 9100.0]);
        assert_eq!(merged.variables["t"], vec![5.0, 6.0]);
    }

    #[tokio::test]
    async fn test_failed_provider_falls_back_to_gfs() {
        let mut weather = MockWeatherProvider::new();
        weather
            .expect_nwp()
            .withf(|source, _, _, _, _| *source == NwpSource::Ukmo)
            .returning(|_, _, _, _, _| Err(WeatherError::Parse("boom".to_string())));
        weather
            .expect_nwp()
            .withf(|source, _, _, _, _| *source == NwpSource::Gfs)
            .returning(|_, _, _, _, _| Ok(frame(NwpSource::Gfs, t0(), vec![1.0], vec![2.0])));

        let day = t0().date_naive();
        let frame = fetch_with_fallback(&weather, NwpSource::Ukmo, 0.0, 0.0, day, day)
            .await
            .unwrap();
        assert_eq!(frame.source, NwpSource::Gfs);
    }
}
