//! PV site power forecasting.
//!
//! NWP from Open-Meteo, optional live inverter readings and a pretrained
//! tree model combine into a 48 hour kW forecast for one site.

pub mod api;
pub mod config;
pub mod domain;
pub mod eval;
pub mod forecast;
pub mod inverters;
pub mod ml;
pub mod solar;
pub mod telemetry;
