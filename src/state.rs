use crate::clock::types::SessionStatus;
use chrono::{NaiveDate, NaiveDateTime};
use parking_lot::RwLock;
use serde::Serialize;

/// Contract of the external state container the classifier reports into.
/// Each setter is invoked only when the classifier resolved the value, so an
/// implementation keeps its previous nearest-date / close-time otherwise.
pub trait SessionSink: Send + Sync {
    fn set_status(&self, status: SessionStatus);
    fn set_nearest_trading_date(&self, date: NaiveDate);
    fn set_last_session_close_time(&self, close: NaiveDateTime);
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub status: Option<SessionStatus>,
    pub nearest_trading_date: Option<NaiveDate>,
    pub last_session_close_time: Option<NaiveDateTime>,
}

/// In-memory session store. The engine always records into one of these so
/// the derived fields stay pollable from the handle; embedders may also pass
/// their own `SessionSink`.
#[derive(Debug, Default)]
pub struct SessionStore {
    inner: RwLock<SessionSnapshot>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.read().clone()
    }
}

impl SessionSink for SessionStore {
    fn set_status(&self, status: SessionStatus) {
        self.inner.write().status = Some(status);
    }

    fn set_nearest_trading_date(&self, date: NaiveDate) {
        self.inner.write().nearest_trading_date = Some(date);
    }

    fn set_last_session_close_time(&self, close: NaiveDateTime) {
        self.inner.write().last_session_close_time = Some(close);
    }
}
