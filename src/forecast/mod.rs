pub mod engine;
pub mod export;
pub mod features;
pub mod history;
pub mod metrics;
pub mod nwp;
pub mod weather;

pub use engine::*;
pub use export::*;
pub use features::{FeatureBuilder, FeatureConfig, FeatureError, FeatureTable, Horizons};
pub use history::PvHistory;
pub use metrics::*;
pub use weather::*;
