//! Weather read from saved Open-Meteo responses instead of the network.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::domain::NwpSource;
use crate::forecast::weather::{
    nwp_frame_from_json, weather_table_from_json, NwpFrame, WeatherError, WeatherProvider, WeatherTable,
};

/// `{pv_id}_{YYYYMMDDHHMM}.json`
pub fn nwp_file_name(pv_id: &str, ts: DateTime<Utc>) -> String {
    format!("{pv_id}_{}.json", ts.format("%Y%m%d%H%M"))
}

/// One saved response, served for every provider and window asked of it
#[derive(Debug, Clone)]
pub struct LocalNwpFile {
    path: PathBuf,
}

impl LocalNwpFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn for_case(dir: &Path, pv_id: &str, ts: DateTime<Utc>) -> Self {
        Self::new(dir.join(nwp_file_name(pv_id, ts)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn body(&self) -> Result<String, WeatherError> {
        debug!(path = %self.path.display(), "reading saved weather");
        tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| WeatherError::Io { path: self.path.display().to_string(), source })
    }
}

#[async_trait]
impl WeatherProvider for LocalNwpFile {
    async fn nwp(
        &self,
        source: NwpSource,
        _latitude: f64,
        _longitude: f64,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<NwpFrame, WeatherError> {
        if end < start {
            return Err(WeatherError::InvalidWindow { start, end });
        }
        nwp_frame_from_json(&self.body().await?, source)
    }

    async fn tabular(
        &self,
        _latitude: f64,
        _longitude: f64,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<WeatherTable, WeatherError> {
        if end < start {
            return Err(WeatherError::InvalidWindow { start, end });
        }
        weather_table_from_json(&self.body().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_file_name() {
        let ts = Utc.with_ymd_and_hms(2021, 1, 26, 1, 15, 0).unwrap();
        assert_eq!(nwp_file_name("8215", ts), "8215_202101260115.json");
    }

    #[tokio::test]
    async fn test_reads_hourly_block() {
        let dir = tempfile::tempdir().unwrap();
        let ts = Utc.with_ymd_and_hms(2021, 1, 26, 0, 0, 0).unwrap();
        let body = json!({
            "hourly": {
                "time": ["2021-01-26T00:00", "2021-01-26T01:00"],
                "temperature_2m": [1.0, 2.0]
            }
        });
        std::fs::write(dir.path().join(nwp_file_name("7", ts)), body.to_string()).unwrap();

        let provider = LocalNwpFile::for_case(dir.path(), "7", ts);
        let day = ts.date_naive();
        let frame = provider.nwp(NwpSource::Gfs, 0.0, 0.0, day, day).await.unwrap();
        assert_eq!(frame.source, NwpSource::Gfs);
        assert_eq!(frame.variable("t"), Some(&[1.0, 2.0][..]));
        assert!(frame.is_missing("vis"));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let provider = LocalNwpFile::new("/nonexistent/1_202101010000.json");
        let day = NaiveDate::from_ymd_opt(2021, 1, 1).unwrap();
        let err = provider.tabular(0.0, 0.0, day, day).await.unwrap_err();
        assert!(matches!(err, WeatherError::Io { .. }));
    }
}
