use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Inverter, InverterError};
use crate::domain::{GenerationPoint, InverterType};

/// Replays a fixed series; empty by default.
///
/// Stands in for a vendor client in demos and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticInverter {
    points: Vec<GenerationPoint>,
}

impl StaticInverter {
    pub fn new(points: Vec<GenerationPoint>) -> Self {
        Self { points }
    }
}

#[async_trait]
impl Inverter for StaticInverter {
    fn vendor(&self) -> InverterType {
        InverterType::None
    }

    /// Samples strictly before `ts`
    async fn get_data(&self, ts: DateTime<Utc>) -> Result<Vec<GenerationPoint>, InverterError> {
        Ok(self.points.iter().filter(|p| p.timestamp < ts).copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_default_is_empty() {
        assert!(StaticInverter::default().get_data(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hides_future_samples() {
        let now = Utc::now();
        let inverter = StaticInverter::new(vec![
            GenerationPoint::new(now - Duration::minutes(5), 1.0),
            GenerationPoint::new(now + Duration::minutes(5), 2.0),
        ]);
        assert_eq!(inverter.get_data(now).await.unwrap().len(), 1);
    }
}
