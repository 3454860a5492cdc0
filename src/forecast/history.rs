//! Recent PV history, reshaped per forecast horizon.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::BTreeMap;

use super::features::Horizons;
use crate::domain::{GenerationPoint, PvSite};
use crate::solar;

/// Division that never produces ±inf: a zero or non-finite denominator
/// yields `fallback`.
pub fn safe_div(num: f64, den: f64, fallback: f64) -> f64 {
    if den == 0.0 || !den.is_finite() {
        fallback
    } else {
        num / den
    }
}

/// Time-sorted PV generation samples (kW)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PvHistory {
    points: Vec<GenerationPoint>,
}

impl PvHistory {
    pub fn new(mut points: Vec<GenerationPoint>) -> Self {
        points.sort_by_key(|p| p.timestamp);
        Self { points }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn points(&self) -> &[GenerationPoint] {
        &self.points
    }

    /// Samples with `start <= ts <= end`
    pub fn window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> impl Iterator<Item = &GenerationPoint> {
        self.points
            .iter()
            .skip_while(move |p| p.timestamp < start)
            .take_while(move |p| p.timestamp <= end)
    }

    /// Keep only samples from `start` up to and including `end`
    pub fn clipped(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { points: self.window(start, end).copied().collect() }
    }

    /// Power as a fraction of what the site would make under clear sky.
    ///
    /// NaN at night (no clear-sky irradiance) so those samples drop out of
    /// the aggregations instead of blowing up.
    pub fn normalized(&self, site: &PvSite) -> Vec<(DateTime<Utc>, f64)> {
        self.points
            .iter()
            .map(|p| {
                let den = solar::poa_global(site, p.timestamp) * site.capacity_kwp;
                (p.timestamp, safe_div(p.power_kw, den, f64::NAN))
            })
            .collect()
    }
}

/// History reshaped as rows = time-of-day slot, columns = calendar date.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryMatrix {
    pub dates: Vec<NaiveDate>,
    /// One row per horizon, one value per date
    pub rows: Vec<Vec<f64>>,
}

/// Per-horizon aggregates over the history days
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryAggregates {
    pub max: Vec<f64>,
    pub mean: Vec<f64>,
    pub median: Vec<f64>,
}

/// Mean of the values in each `duration`-minute bin anchored at `now`,
/// ignoring anything at or after `now` and any NaN.
fn resample(values: &[(DateTime<Utc>, f64)], now: DateTime<Utc>, duration: i64) -> BTreeMap<i64, f64> {
    let bin_seconds = duration * 60;
    let mut sums: BTreeMap<i64, (f64, usize)> = BTreeMap::new();
    for (ts, value) in values {
        if *ts >= now || !value.is_finite() {
            continue;
        }
        let bin = (*ts - now).num_seconds().div_euclid(bin_seconds);
        let entry = sums.entry(bin).or_insert((0.0, 0));
        entry.0 += value;
        entry.1 += 1;
    }
    sums.into_iter().map(|(bin, (sum, n))| (bin, sum / n as f64)).collect()
}

/// Average PV per horizon and per past day.
///
/// Data before `now` is resampled into horizon-sized bins anchored at
/// `now`. Every bin maps to a slot within the day, so the same slot on
/// previous days lines up with horizon `i`, `i + slots_per_day`, and so on.
pub fn history_per_horizon(
    values: &[(DateTime<Utc>, f64)],
    now: DateTime<Utc>,
    horizons: &Horizons,
) -> HistoryMatrix {
    let duration = horizons.duration_minutes;
    let slots = horizons.slots_per_day();
    let bins = resample(values, now, duration);

    if bins.is_empty() {
        return HistoryMatrix {
            dates: Vec::new(),
            rows: vec![vec![f64::NAN]; horizons.count],
        };
    }

    let mut by_date: BTreeMap<NaiveDate, Vec<f64>> = BTreeMap::new();
    for (bin, value) in &bins {
        let start = now + Duration::minutes(bin * duration);
        let slot = bin.rem_euclid(slots as i64) as usize;
        by_date
            .entry(start.date_naive())
            .or_insert_with(|| vec![f64::NAN; slots])[slot] = *value;
    }

    let dates: Vec<NaiveDate> = by_date.keys().copied().collect();
    let day_rows: Vec<Vec<f64>> = (0..slots)
        .map(|slot| by_date.values().map(|col| col[slot]).collect())
        .collect();

    let rows = (0..horizons.count).map(|i| day_rows[i % slots].clone()).collect();
    HistoryMatrix { dates, rows }
}

fn finite_sorted(row: &[f64]) -> Vec<f64> {
    let mut v: Vec<f64> = row.iter().copied().filter(|x| x.is_finite()).collect();
    v.sort_by(f64::total_cmp);
    v
}

impl HistoryMatrix {
    /// NaN-ignoring max/mean/median per row; NaN when a row has no data
    pub fn aggregate(&self) -> HistoryAggregates {
        let mut max = Vec::with_capacity(self.rows.len());
        let mut mean = Vec::with_capacity(self.rows.len());
        let mut median = Vec::with_capacity(self.rows.len());

        for row in &self.rows {
            let v = finite_sorted(row);
            if v.is_empty() {
                max.push(f64::NAN);
                mean.push(f64::NAN);
                median.push(f64::NAN);
                continue;
            }
            let n = v.len();
            max.push(v[n - 1]);
            mean.push(v.iter().sum::<f64>() / n as f64);
            median.push(if n % 2 == 1 { v[n / 2] } else { (v[n / 2 - 1] + v[n / 2]) / 2.0 });
        }

        HistoryAggregates { max, mean, median }
    }
}

/// Raw samples in `[now - minutes, now]`
pub fn recent_values(history: &PvHistory, now: DateTime<Utc>, minutes: i64) -> Vec<f64> {
    history
        .window(now - Duration::minutes(minutes), now)
        .map(|p| p.power_kw)
        .collect()
}

/// Mean of the finite values, NaN when there are none
pub fn nan_mean(values: &[f64]) -> f64 {
    let finite = values.iter().filter(|v| v.is_finite());
    let (sum, n) = finite.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        f64::NAN
    } else {
        sum / n as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_safe_div() {
        assert_eq!(safe_div(1.0, 2.0, 0.0), 0.5);
        assert_eq!(safe_div(1.0, 0.0, 0.0), 0.0);
        assert!(safe_div(1.0, f64::INFINITY, f64::NAN).is_nan());
    }

    proptest! {
        #[test]
        fn test_safe_div_never_infinite(num in -1e6f64..1e6, den in -1e6f64..1e6) {
            prop_assert!(!safe_div(num, den, 0.0).is_infinite());
        }
    }

    #[test]
    fn test_empty_history_is_all_nan() {
        let h = Horizons::new(15, 8);
        let m = history_per_horizon(&[], now(), &h);
        assert_eq!(m.rows.len(), 8);
        let agg = m.aggregate();
        assert!(agg.max.iter().all(|v| v.is_nan()));
        assert!(agg.median.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_same_slot_on_previous_days_lines_up() {
        // 1 hour horizons, 48 of them. Values at now-24h and now-48h fall in
        // slot 0 of their respective days; a value at now-23h falls in slot 1.
        let h = Horizons::new(60, 48);
        let values = vec![
            (now() - Duration::hours(48), 1.0),
            (now() - Duration::hours(24), 3.0),
            (now() - Duration::hours(23) + Duration::minutes(10), 5.0),
            (now(), 100.0), // at `now`, ignored
        ];
        let m = history_per_horizon(&values, now(), &h);
        assert_eq!(m.dates.len(), 2);
        let agg = m.aggregate();

        assert_abs_diff_eq!(agg.mean[0], 2.0);
        assert_abs_diff_eq!(agg.max[0], 3.0);
        assert_abs_diff_eq!(agg.median[0], 2.0);
        assert_abs_diff_eq!(agg.max[1], 5.0);
        // Second day of horizons repeats the first
        assert_abs_diff_eq!(agg.mean[24], 2.0);
        assert_abs_diff_eq!(agg.max[25], 5.0);
        assert!(agg.max[2].is_nan());
    }

    #[test]
    fn test_bins_average_their_samples() {
        let h = Horizons::new(15, 96);
        let values = vec![
            (now() - Duration::minutes(15), 1.0),
            (now() - Duration::minutes(10), 3.0),
            (now() - Duration::minutes(5), f64::NAN),
        ];
        let agg = history_per_horizon(&values, now(), &h).aggregate();
        // bin -1 -> slot 95
        assert_abs_diff_eq!(agg.mean[95], 2.0);
    }

    #[test]
    fn test_recent_values_window_is_inclusive() {
        let history = PvHistory::new(vec![
            GenerationPoint::new(now() - Duration::minutes(45), 9.0),
            GenerationPoint::new(now(), 2.0),
            GenerationPoint::new(now() - Duration::minutes(30), 1.0),
        ]);
        let recent = recent_values(&history, now(), 30);
        assert_eq!(recent, vec![1.0, 2.0]);
        assert_abs_diff_eq!(nan_mean(&recent), 1.5);
        assert!(nan_mean(&[]).is_nan());
    }

    #[test]
    fn test_normalized_is_nan_at_night() {
        let site = PvSite::new(51.5, 0.0, 4.0);
        let night = Utc.with_ymd_and_hms(2024, 1, 10, 1, 0, 0).unwrap();
        let day = Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap();
        let history = PvHistory::new(vec![
            GenerationPoint::new(night, 0.0),
            GenerationPoint::new(day, 2.0),
        ]);
        let norm = history.normalized(&site);
        assert!(norm[0].1.is_nan());
        assert!(norm[1].1 > 0.0 && norm[1].1 < 1.0);
    }
}
