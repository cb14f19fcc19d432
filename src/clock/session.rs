use crate::clock::types::{SessionStatus, TradingCalendar};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};

/// Same-day session boundaries: morning 09:30-11:30, afternoon 13:00-15:00,
/// local wall-clock components of the current date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionBounds {
    pub morning_open: NaiveDateTime,
    pub morning_close: NaiveDateTime,
    pub afternoon_open: NaiveDateTime,
    pub afternoon_close: NaiveDateTime,
}

impl SessionBounds {
    pub fn for_date(date: NaiveDate) -> Self {
        Self {
            morning_open: at(date, 9, 30),
            morning_close: at(date, 11, 30),
            afternoon_open: at(date, 13, 0),
            afternoon_close: at(date, 15, 0),
        }
    }
}

fn at(date: NaiveDate, hour: u32, minute: u32) -> NaiveDateTime {
    let time = NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN);
    NaiveDateTime::new(date, time)
}

/// Result of one classifier pass. `nearest_trading_date` is resolved only on
/// non-trading days; `last_session_close` only when the current instant sits
/// strictly after a close boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionVerdict {
    pub status: SessionStatus,
    pub nearest_trading_date: Option<NaiveDate>,
    pub last_session_close: Option<NaiveDateTime>,
}

/// Maps an instant and the calendar to a session verdict.
///
/// The boundary rule is asymmetric on purpose: every open/close instant is
/// excluded by strict comparison, except the afternoon open (13:00:00
/// exactly) which counts as in-session via an explicit equality check. The
/// corollaries fall out of the strict chain below: 09:30:00 and 11:30:00
/// exactly classify as between-sessions with no close time, and 15:00:00
/// exactly reports the morning close.
pub fn classify(now: NaiveDateTime, calendar: &TradingCalendar) -> SessionVerdict {
    // Boundaries are second-granular; a sub-second offset must not tip the
    // strict comparisons or defeat the 13:00:00 equality check.
    let now = now.with_nanosecond(0).unwrap_or(now);
    let today = now.date();

    if !calendar.contains(today) {
        return SessionVerdict {
            status: SessionStatus::ClosedNonTradingDay,
            nearest_trading_date: calendar.nearest_on_or_before(today),
            last_session_close: None,
        };
    }

    let bounds = SessionBounds::for_date(today);
    if now < bounds.morning_open {
        SessionVerdict {
            status: SessionStatus::BeforeOpen,
            nearest_trading_date: None,
            last_session_close: None,
        }
    } else if now > bounds.morning_close && now < bounds.afternoon_open {
        // Midday gap, checked before the window test.
        SessionVerdict {
            status: SessionStatus::AfterOrBetweenSession,
            nearest_trading_date: None,
            last_session_close: Some(bounds.morning_close),
        }
    } else if in_session_window(now, &bounds) || now == bounds.afternoon_open {
        SessionVerdict {
            status: SessionStatus::InSession,
            nearest_trading_date: None,
            last_session_close: None,
        }
    } else {
        SessionVerdict {
            status: SessionStatus::AfterOrBetweenSession,
            nearest_trading_date: None,
            last_session_close: last_session_close(now, &bounds),
        }
    }
}

/// Strict interior of either daily window.
pub fn in_session_window(now: NaiveDateTime, bounds: &SessionBounds) -> bool {
    (now > bounds.morning_open && now < bounds.morning_close)
        || (now > bounds.afternoon_open && now < bounds.afternoon_close)
}

/// Most recent close boundary strictly before `now`, if any.
pub fn last_session_close(now: NaiveDateTime, bounds: &SessionBounds) -> Option<NaiveDateTime> {
    if now > bounds.afternoon_close {
        Some(bounds.afternoon_close)
    } else if now > bounds.morning_close {
        Some(bounds.morning_close)
    } else {
        None
    }
}
