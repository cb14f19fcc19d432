use crate::error::ClockError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::{DEFAULT_DRIFT_LIMIT_MS, TRADE_DATE_FORMAT};

pub const DEFAULT_FRAME_POLL_MS: u64 = 250;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_SESSION_TRACKING: bool = true;
pub const MIN_FRAME_POLL_MS: u64 = 16;
pub const MAX_FRAME_POLL_MS: u64 = 1_000;
pub const MIN_DRIFT_LIMIT_MS: i64 = 1_000;
pub const MAX_DRIFT_LIMIT_MS: i64 = 600_000;
pub const MIN_REQUEST_TIMEOUT_MS: u64 = 1_000;
pub const MAX_REQUEST_TIMEOUT_MS: u64 = 60_000;

/// Discrete trading-session state derived from the virtual clock and the
/// trading calendar.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    ClosedNonTradingDay,
    InSession,
    AfterOrBetweenSession,
    BeforeOpen,
}

impl SessionStatus {
    /// Stable single-character code used by the backend protocol.
    pub fn wire_code(self) -> &'static str {
        match self {
            Self::ClosedNonTradingDay => "0",
            Self::InSession => "1",
            Self::AfterOrBetweenSession => "2",
            Self::BeforeOpen => "3",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DriverState {
    Stopped,
    Active,
    Suspended,
}

/// Where the most recent sync got its timestamp from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncSource {
    Server,
    LocalFallback,
}

/// Window/document lifecycle signals forwarded by the shell.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WindowSignal {
    FocusGained,
    FocusLost,
    VisibilityShown,
    VisibilityHidden,
}

/// Ordered set of trading dates, populated once per engine lifetime and
/// read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TradingCalendar {
    days: BTreeSet<NaiveDate>,
}

impl TradingCalendar {
    pub fn from_dates<I>(dates: I) -> Self
    where
        I: IntoIterator<Item = NaiveDate>,
    {
        Self {
            days: dates.into_iter().collect(),
        }
    }

    /// Parses and normalizes raw calendar values; rejects the whole batch on
    /// the first malformed entry.
    pub fn from_raw_dates<S: AsRef<str>>(raw: &[S]) -> Result<Self, ClockError> {
        let mut days = BTreeSet::new();
        for value in raw {
            days.insert(parse_trade_date(value.as_ref())?);
        }
        Ok(Self { days })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.days.contains(&date)
    }

    /// Latest trading date not after `date`, if any.
    pub fn nearest_on_or_before(&self, date: NaiveDate) -> Option<NaiveDate> {
        self.days.range(..=date).next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }
}

/// Accepts `YYYY-MM-DD`, compact `YYYYMMDD`, or any value with a
/// `YYYY-MM-DD` prefix (datetime strings from the calendar endpoint).
pub fn parse_trade_date(raw: &str) -> Result<NaiveDate, ClockError> {
    let trimmed = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, TRADE_DATE_FORMAT) {
        return Ok(date);
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y%m%d") {
        return Ok(date);
    }
    if let Some(prefix) = trimmed.get(..10) {
        if let Ok(date) = NaiveDate::parse_from_str(prefix, TRADE_DATE_FORMAT) {
            return Ok(date);
        }
    }
    Err(ClockError::InvalidArgument(format!(
        "unrecognized trade date '{trimmed}'"
    )))
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartClockArgs {
    pub base_url: String,
    pub frame_poll_ms: Option<u64>,
    pub drift_limit_ms: Option<i64>,
    pub request_timeout_ms: Option<u64>,
    pub session_tracking: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ClockConfig {
    pub base_url: String,
    pub frame_poll_ms: u64,
    pub drift_limit_ms: i64,
    pub request_timeout_ms: u64,
    pub session_tracking: bool,
}

impl StartClockArgs {
    pub fn normalize(self) -> Result<ClockConfig, ClockError> {
        let base_url = self.base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(ClockError::InvalidArgument(
                "baseUrl must be non-empty".to_string(),
            ));
        }
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ClockError::InvalidArgument(
                "baseUrl must start with http:// or https://".to_string(),
            ));
        }

        let frame_poll_ms = self.frame_poll_ms.unwrap_or(DEFAULT_FRAME_POLL_MS);
        if !(MIN_FRAME_POLL_MS..=MAX_FRAME_POLL_MS).contains(&frame_poll_ms) {
            return Err(ClockError::InvalidArgument(format!(
                "framePollMs must be between {MIN_FRAME_POLL_MS} and {MAX_FRAME_POLL_MS}"
            )));
        }

        let drift_limit_ms = self.drift_limit_ms.unwrap_or(DEFAULT_DRIFT_LIMIT_MS);
        if !(MIN_DRIFT_LIMIT_MS..=MAX_DRIFT_LIMIT_MS).contains(&drift_limit_ms) {
            return Err(ClockError::InvalidArgument(format!(
                "driftLimitMs must be between {MIN_DRIFT_LIMIT_MS} and {MAX_DRIFT_LIMIT_MS}"
            )));
        }

        let request_timeout_ms = self
            .request_timeout_ms
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS);
        if !(MIN_REQUEST_TIMEOUT_MS..=MAX_REQUEST_TIMEOUT_MS).contains(&request_timeout_ms) {
            return Err(ClockError::InvalidArgument(format!(
                "requestTimeoutMs must be between {MIN_REQUEST_TIMEOUT_MS} and {MAX_REQUEST_TIMEOUT_MS}"
            )));
        }

        let session_tracking = self.session_tracking.unwrap_or(DEFAULT_SESSION_TRACKING);

        Ok(ClockConfig {
            base_url,
            frame_poll_ms,
            drift_limit_ms,
            request_timeout_ms,
            session_tracking,
        })
    }
}
