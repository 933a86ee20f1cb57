//! Metric types exposed by the metering API and the per-day payloads built from them

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Kind of metering data that can be requested for a meter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    /// One consumption value per day (Wh)
    DailyConsumption,
    /// Consumption sampled every 30 minutes (W)
    ConsumptionLoadCurve,
    /// Maximum power reached each day (VA)
    ConsumptionMaxPower,
    /// One production value per day (Wh)
    DailyProduction,
    /// Production sampled every 30 minutes (W)
    ProductionLoadCurve,
}

impl MetricType {
    /// All supported metrics
    pub const ALL: [Self; 5] = [
        Self::DailyConsumption,
        Self::ConsumptionLoadCurve,
        Self::ConsumptionMaxPower,
        Self::DailyProduction,
        Self::ProductionLoadCurve,
    ];

    /// Stable identifier used in storage and URLs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DailyConsumption => "daily_consumption",
            Self::ConsumptionLoadCurve => "consumption_load_curve",
            Self::ConsumptionMaxPower => "daily_consumption_max_power",
            Self::DailyProduction => "daily_production",
            Self::ProductionLoadCurve => "production_load_curve",
        }
    }

    /// Path of the upstream endpoint serving this metric
    #[must_use]
    pub fn api_path(self) -> String {
        format!("metering_data_{}/v5/{}", self.family(), self.as_str())
    }

    /// Upstream API family
    const fn family(self) -> &'static str {
        match self {
            Self::DailyConsumption | Self::ConsumptionMaxPower => "dc",
            Self::ConsumptionLoadCurve => "clc",
            Self::DailyProduction => "dp",
            Self::ProductionLoadCurve => "plc",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| Error::NotFound(format!("unknown metric type: {s}")))
    }
}

/// A single reading as returned upstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reading {
    /// Timestamp (`YYYY-MM-DD` or `YYYY-MM-DD HH:MM:SS`)
    pub date: String,
    /// Measured value, kept verbatim
    pub value: String,
}

impl Reading {
    /// Calendar day the reading belongs to
    #[must_use]
    pub fn day(&self) -> Option<NaiveDate> {
        self.date
            .get(..10)
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
    }
}

/// All readings for one calendar day: the unit of caching
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayPayload {
    pub date: NaiveDate,
    pub readings: Vec<Reading>,
}

impl DayPayload {
    /// Group readings by calendar day, dropping readings with an unparsable date
    #[must_use]
    pub fn split_by_day(readings: Vec<Reading>) -> Vec<Self> {
        let mut days: std::collections::BTreeMap<NaiveDate, Vec<Reading>> =
            std::collections::BTreeMap::new();
        for reading in readings {
            match reading.day() {
                Some(day) => days.entry(day).or_default().push(reading),
                None => tracing::warn!(date = %reading.date, "dropping reading with invalid date"),
            }
        }
        days.into_iter()
            .map(|(date, readings)| Self { date, readings })
            .collect()
    }
}
