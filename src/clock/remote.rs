use crate::clock::engine::now_unix_ms;
use crate::clock::types::{SyncSource, TradingCalendar};
use crate::clock::DISPLAY_TIME_FORMAT;
use crate::error::ClockError;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use reqwest::Client;
use serde::Deserialize;
use tracing::warn;

fn service_time_endpoint(base_url: &str) -> String {
    format!("{base_url}/serviceTime")
}

fn trade_calendar_endpoint(base_url: &str) -> String {
    format!("{base_url}/tradeCalendar")
}

#[derive(Debug, Deserialize)]
struct ServiceTimeWire {
    data: ServiceTimeValue,
}

/// The backend reports the authoritative instant either as epoch
/// milliseconds or as a datetime string; both shapes are in the wild.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ServiceTimeValue {
    Millis(i64),
    Text(String),
}

impl ServiceTimeValue {
    fn into_unix_ms(self) -> Result<i64, ClockError> {
        match self {
            Self::Millis(ms) => Ok(ms),
            Self::Text(text) => parse_datetime_ms(&text),
        }
    }
}

fn parse_datetime_ms(text: &str) -> Result<i64, ClockError> {
    let trimmed = text.trim();
    if let Ok(instant) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(instant.timestamp_millis());
    }
    let naive = NaiveDateTime::parse_from_str(trimmed, DISPLAY_TIME_FORMAT)?;
    match Local.from_local_datetime(&naive).earliest() {
        Some(instant) => Ok(instant.timestamp_millis()),
        None => Err(ClockError::InvalidArgument(format!(
            "datetime '{trimmed}' is not representable in local time"
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct TradeCalendarWire {
    data: Vec<TradeCalendarEntryWire>,
}

#[derive(Debug, Deserialize)]
struct TradeCalendarEntryWire {
    trade_date: String,
}

impl TryFrom<TradeCalendarWire> for TradingCalendar {
    type Error = ClockError;

    fn try_from(value: TradeCalendarWire) -> Result<Self, Self::Error> {
        let raw: Vec<String> = value
            .data
            .into_iter()
            .map(|entry| entry.trade_date)
            .collect();
        TradingCalendar::from_raw_dates(&raw)
    }
}

pub async fn fetch_service_time_ms(client: &Client, base_url: &str) -> Result<i64, ClockError> {
    let endpoint = service_time_endpoint(base_url);
    let response = client.get(endpoint).send().await?.error_for_status()?;
    let payload = response.json::<ServiceTimeWire>().await?;
    payload.data.into_unix_ms()
}

pub async fn fetch_trade_calendar(
    client: &Client,
    base_url: &str,
) -> Result<TradingCalendar, ClockError> {
    let endpoint = trade_calendar_endpoint(base_url);
    let response = client.get(endpoint).send().await?.error_for_status()?;
    let payload = response.json::<TradeCalendarWire>().await?;
    payload.try_into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOutcome {
    pub timestamp_ms: i64,
    pub source: SyncSource,
}

/// Fetches the authoritative time, degrading to the local system clock on
/// any failure. Sync never surfaces a hard error to the caller.
pub async fn sync_service_time(client: &Client, base_url: &str) -> SyncOutcome {
    match fetch_service_time_ms(client, base_url).await {
        Ok(timestamp_ms) => SyncOutcome {
            timestamp_ms,
            source: SyncSource::Server,
        },
        Err(error) => {
            warn!("service time sync failed, falling back to the local system clock: {error}");
            SyncOutcome {
                timestamp_ms: now_unix_ms(),
                source: SyncSource::LocalFallback,
            }
        }
    }
}
