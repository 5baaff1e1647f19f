use std::time::Duration;

use thiserror::Error;

/// スクレイプ処理の失敗
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("Platform and username are required.")]
    InvalidRequest,

    #[error("navigation failed: {0}")]
    NavigationFailed(String),

    #[error("timed out after {}ms waiting for page content", .0.as_millis())]
    Timeout(Duration),

    #[error("Could not find data to scrape on the page.")]
    ExtractionFailed,

    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    #[error("browser session error: {0}")]
    SessionError(String),
}

impl ScrapeError {
    /// HTTP status this failure maps to at the route boundary
    pub fn status(&self) -> u16 {
        match self {
            ScrapeError::InvalidRequest => 400,
            _ => 500,
        }
    }
}

/// 起動時の設定読み込みエラー
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}
