use percent_encoding::percent_decode_str;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::error::ScrapeError;
use crate::scrape::Scraper;

pub const SCRAPE_PREFIX: &str = "/scrape";
pub const ALIVE_MESSAGE: &str = "Scraper service is running.";

/// フレームワーク非依存のレスポンス
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: u16,
    pub body: Body,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Json(Value),
    Text(&'static str),
}

impl Reply {
    pub fn json(status: u16, value: Value) -> Self {
        Self { status, body: Body::Json(value) }
    }

    pub fn text(status: u16, text: &'static str) -> Self {
        Self { status, body: Body::Text(text) }
    }

    fn error(status: u16, message: String) -> Self {
        Self::json(status, json!({"error": message}))
    }

    pub fn alive() -> Self {
        Self::text(200, ALIVE_MESSAGE)
    }

    pub fn not_found() -> Self {
        Self::text(404, "Not Found")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeRequest {
    pub platform: String,
    pub username: String,
}

impl ScrapeRequest {
    /// `/scrape/<platform>/<username>` を分解する。
    /// ルート外なら `None`、セグメント不足・空なら `InvalidRequest`
    pub fn from_path(path: &str) -> Option<Result<Self, ScrapeError>> {
        let path = path.split(|c: char| c == '?' || c == '#').next().unwrap_or_default();
        let rest = path.strip_prefix(SCRAPE_PREFIX)?;
        if !(rest.is_empty() || rest.starts_with('/')) {
            return None;
        }
        let rest = rest.strip_prefix('/').unwrap_or(rest);

        let segments: Vec<&str> = if rest.is_empty() { Vec::new() } else { rest.split('/').collect() };
        if segments.len() > 2 {
            return None;
        }

        let platform = segments.first().map(|s| decode(s)).unwrap_or_default();
        let username = segments.get(1).map(|s| decode(s)).unwrap_or_default();
        if platform.is_empty() || username.is_empty() {
            return Some(Err(ScrapeError::InvalidRequest));
        }
        Some(Ok(Self { platform, username }))
    }
}

// URLエンコードされている可能性があるためデコード（UTF-8 でなければそのまま）
fn decode(segment: &str) -> String {
    percent_decode_str(segment)
        .decode_utf8()
        .map(|cow| cow.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

/// `/scrape` 配下のパスをスクレイパに渡し、結果をレスポンスに整形する
pub async fn scrape_reply(scraper: &Scraper, path: &str) -> Reply {
    let req = match ScrapeRequest::from_path(path) {
        None => return Reply::not_found(),
        Some(Err(e)) => return Reply::error(e.status(), e.to_string()),
        Some(Ok(req)) => req,
    };

    info!(platform = %req.platform, username = %req.username, "[API] Received request");
    match scraper.scrape(&req.platform, &req.username).await {
        Ok(data) => {
            info!(platform = %req.platform, username = %req.username, "[API] Successfully scraped data");
            Reply::json(200, data)
        }
        Err(e) => {
            warn!(platform = %req.platform, username = %req.username, "[API] Error scraping: {}", e);
            Reply::error(e.status(), format!("An error occurred: {}", e))
        }
    }
}

/// 登録済みルートに一致しなかったリクエストの処理。GET 以外は常に 404
pub async fn fallback_reply(scraper: &Scraper, method: &str, path: &str) -> Reply {
    if !is_get(method) {
        return Reply::not_found();
    }
    match path.split('?').next().unwrap_or_default() {
        "/" | "" => Reply::alive(),
        _ => scrape_reply(scraper, path).await,
    }
}

// kurosabi のメソッド表記（Debug 出力）を正規化して比較する
pub fn is_get(method: &str) -> bool {
    method.trim().trim_matches('"').eq_ignore_ascii_case("GET")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScrapeSettings;
    use crate::session::fake::{FakeLauncher, Script};
    use serde_json::json;
    use std::sync::Arc;

    fn scraper(script: Script) -> (Scraper, Arc<FakeLauncher>) {
        let launcher = Arc::new(FakeLauncher::new(script));
        (Scraper::new(launcher.clone(), ScrapeSettings::default()), launcher)
    }

    fn required() -> Reply {
        Reply::json(400, json!({"error": "Platform and username are required."}))
    }

    #[test]
    fn parses_path() {
        let req = ScrapeRequest::from_path("/scrape/epic/King-Tet").unwrap().unwrap();
        assert_eq!(req, ScrapeRequest { platform: "epic".into(), username: "King-Tet".into() });
    }

    #[test]
    fn decodes_segments_and_ignores_query() {
        let req = ScrapeRequest::from_path("/scrape/psn/John%20Doe?x=1").unwrap().unwrap();
        assert_eq!(req.username, "John Doe");
    }

    #[test]
    fn foreign_paths_are_not_ours() {
        assert!(ScrapeRequest::from_path("/status").is_none());
        assert!(ScrapeRequest::from_path("/scraper/epic/x").is_none());
        assert!(ScrapeRequest::from_path("/scrape/epic/x/extra").is_none());
    }

    #[tokio::test]
    async fn missing_params_are_rejected_without_scraping() {
        let (s, launcher) = scraper(Script::rendering("{}"));
        for path in ["/scrape", "/scrape/", "/scrape/epic", "/scrape/epic/", "/scrape//King-Tet"] {
            assert_eq!(scrape_reply(&s, path).await, required(), "{}", path);
        }
        assert_eq!(launcher.acquired(), 0);
    }

    #[tokio::test]
    async fn whitespace_segment_counts_as_present() {
        let (s, launcher) = scraper(Script::rendering("{}"));
        assert_eq!(scrape_reply(&s, "/scrape/%20/x").await.status, 200);
        assert_eq!(launcher.acquired(), 1);
    }

    #[tokio::test]
    async fn success_relays_payload_verbatim() {
        let (s, launcher) = scraper(Script::rendering(r#"{"id":"King-Tet"}"#));
        let reply = scrape_reply(&s, "/scrape/epic/King-Tet").await;
        assert_eq!(reply.status, 200);
        let Body::Json(body) = reply.body else { panic!("expected json body") };
        assert_eq!(serde_json::to_string(&body).unwrap(), r#"{"id":"King-Tet"}"#);
        assert_eq!(
            launcher.urls(),
            vec!["https://api.tracker.gg/api/v2/rocket-league/standard/profile/epic/King-Tet".to_string()]
        );
    }

    #[tokio::test]
    async fn malformed_payload_is_500_with_parse_message() {
        let (s, _) = scraper(Script::rendering("not-json"));
        let reply = scrape_reply(&s, "/scrape/epic/King-Tet").await;
        assert_eq!(reply.status, 500);
        let Body::Json(body) = reply.body else { panic!("expected json body") };
        let msg = body["error"].as_str().unwrap();
        assert!(msg.starts_with("An error occurred: malformed payload: "), "{}", msg);
        assert!(msg.contains("expected"), "{}", msg);
    }

    #[tokio::test]
    async fn extraction_failure_message() {
        let (s, _) = scraper(Script::rendering(""));
        let reply = scrape_reply(&s, "/scrape/steam/x").await;
        assert_eq!(
            reply,
            Reply::json(500, json!({"error": "An error occurred: Could not find data to scrape on the page."}))
        );
    }

    #[tokio::test]
    async fn fallback_serves_liveness_and_not_found() {
        let (s, launcher) = scraper(Script::rendering("{}"));
        assert_eq!(fallback_reply(&s, "GET", "/").await, Reply::alive());
        assert_eq!(fallback_reply(&s, "GET", "/nope").await, Reply::not_found());
        assert_eq!(fallback_reply(&s, "GET", "/scrape/epic").await, required());
        assert_eq!(launcher.acquired(), 0);
    }

    #[tokio::test]
    async fn non_get_methods_never_scrape() {
        let (s, launcher) = scraper(Script::rendering(r#"{"id":"King-Tet"}"#));
        for method in ["POST", "PUT", "DELETE", "PATCH", "\"POST\""] {
            assert_eq!(fallback_reply(&s, method, "/scrape/epic/King-Tet").await, Reply::not_found(), "{}", method);
            assert_eq!(fallback_reply(&s, method, "/").await, Reply::not_found(), "{}", method);
        }
        assert_eq!(launcher.acquired(), 0);
        assert_eq!(fallback_reply(&s, "get", "/scrape/epic/King-Tet").await.status, 200);
        assert_eq!(launcher.acquired(), 1);
    }

    #[test]
    fn method_names_are_normalized() {
        assert!(is_get("GET"));
        assert!(is_get("\"GET\""));
        assert!(!is_get("HEAD"));
    }
}
