use serde::ser::Serializer;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("request error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("date parse error: {0}")]
    DateParse(#[from] chrono::ParseError),
}

impl serde::Serialize for ClockError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
