use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_UPSTREAM_TEMPLATE: &str =
    "https://api.tracker.gg/api/v2/rocket-league/standard/profile/{platform}/{username}";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/108.0.0.0 Safari/537.36";
pub const DEFAULT_SELECTOR: &str = "pre";

/// スクレイプ1回分の挙動を決めるパラメータ
#[derive(Debug, Clone)]
pub struct ScrapeSettings {
    pub upstream_template: String,
    pub user_agent: String,
    pub selector: String,
    pub element_timeout: Duration,
    pub navigation_timeout: Duration,
    pub idle: IdlePolicy,
    pub max_sessions: Option<usize>,
}

/// networkidle2 相当: 同時接続数が `max_inflight` 以下の状態が `window` 続いたら静穏とみなす
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdlePolicy {
    pub max_inflight: usize,
    pub window: Duration,
}

impl Default for IdlePolicy {
    fn default() -> Self {
        Self {
            max_inflight: 2,
            window: Duration::from_millis(500),
        }
    }
}

impl Default for ScrapeSettings {
    fn default() -> Self {
        Self {
            upstream_template: DEFAULT_UPSTREAM_TEMPLATE.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            selector: DEFAULT_SELECTOR.to_string(),
            element_timeout: Duration::from_secs(15),
            navigation_timeout: Duration::from_secs(30),
            idle: IdlePolicy::default(),
            max_sessions: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BrowserSettings {
    pub executable: Option<PathBuf>,
    pub no_sandbox: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: Ipv4Addr,
    pub port: u16,
    pub scrape: ScrapeSettings,
    pub browser: BrowserSettings,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 任意のキー検索関数から設定を組み立てる（空文字は未設定扱い）
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let defaults = ScrapeSettings::default();

        let upstream_template = get("SCRAPER_UPSTREAM_TEMPLATE").unwrap_or(defaults.upstream_template);
        for placeholder in ["{platform}", "{username}"] {
            if !upstream_template.contains(placeholder) {
                return Err(ConfigError::Invalid {
                    key: "SCRAPER_UPSTREAM_TEMPLATE",
                    value: upstream_template,
                    reason: format!("missing {} placeholder", placeholder),
                });
            }
        }

        let idle = IdlePolicy {
            max_inflight: parse_or(&get, "SCRAPER_IDLE_CONNECTIONS", defaults.idle.max_inflight)?,
            window: millis_or(&get, "SCRAPER_IDLE_WINDOW_MS", defaults.idle.window)?,
        };

        let max_sessions = parse_opt::<usize, _>(&get, "SCRAPER_MAX_SESSIONS")?;
        if max_sessions == Some(0) {
            return Err(ConfigError::Invalid {
                key: "SCRAPER_MAX_SESSIONS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let scrape = ScrapeSettings {
            upstream_template,
            user_agent: get("SCRAPER_USER_AGENT").unwrap_or(defaults.user_agent),
            selector: get("SCRAPER_SELECTOR").unwrap_or(defaults.selector),
            element_timeout: millis_or(&get, "SCRAPER_ELEMENT_TIMEOUT_MS", defaults.element_timeout)?,
            navigation_timeout: millis_or(&get, "SCRAPER_NAVIGATION_TIMEOUT_MS", defaults.navigation_timeout)?,
            idle,
            max_sessions,
        };

        let browser = BrowserSettings {
            executable: get("CHROME_EXECUTABLE").map(PathBuf::from),
            no_sandbox: parse_bool(&get, "SCRAPER_NO_SANDBOX")?,
        };

        Ok(Self {
            host: parse_or(&get, "HOST", Ipv4Addr::UNSPECIFIED)?,
            port: parse_or(&get, "PORT", DEFAULT_PORT)?,
            scrape,
            browser,
        })
    }
}

fn parse_opt<T, G>(get: &G, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|e| ConfigError::Invalid {
            key,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    Ok(parse_opt(get, key)?.unwrap_or(default))
}

fn millis_or<G>(get: &G, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    Ok(parse_opt::<u64, _>(get, key)?
        .map(Duration::from_millis)
        .unwrap_or(default))
}

fn parse_bool<G>(get: &G, key: &'static str) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key,
                value: v,
                reason: "expected a boolean".to_string(),
            }),
        },
    }
}
