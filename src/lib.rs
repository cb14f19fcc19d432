//! Drift-corrected market clock and trading-session engine.
//!
//! The engine keeps a virtual timestamp that advances in whole seconds,
//! anchored to a remote time service (with a local-clock fallback), and
//! derives the current trading-session state from a cached trading
//! calendar. Two cooperating drivers keep it ticking: a suspendable
//! high-frequency one for the foreground and an always-on one-second
//! backup that also recalibrates against the system clock after long gaps.

pub mod clock;
pub mod error;
pub mod state;

pub use clock::engine::{launch_clock_engine, start_clock_engine, ClockEngineHandle};
pub use clock::session::{classify, SessionVerdict};
pub use clock::types::{
    DriverState, SessionStatus, StartClockArgs, SyncSource, TradingCalendar, WindowSignal,
};
pub use error::ClockError;
pub use state::{SessionSink, SessionSnapshot, SessionStore};
