use std::sync::Arc;
use std::time::Duration;

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ScrapeSettings;
use crate::error::ScrapeError;
use crate::session::{Session, SessionLauncher};

const ELEMENT_POLL: Duration = Duration::from_millis(100);

// パスセグメントとして安全でない文字（区切り文字の / と % も含む）
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'\\')
    .add(b'`')
    .add(b'{')
    .add(b'}');

pub struct Scraper {
    launcher: Arc<dyn SessionLauncher>,
    settings: ScrapeSettings,
    limiter: Option<Arc<Semaphore>>,
}

impl Scraper {
    pub fn new(launcher: Arc<dyn SessionLauncher>, settings: ScrapeSettings) -> Self {
        let limiter = settings.max_sessions.map(|n| Arc::new(Semaphore::new(n)));
        Self {
            launcher,
            settings,
            limiter,
        }
    }

    /// platform / username をエンコードして上流URLに埋め込む
    pub fn target_url(&self, platform: &str, username: &str) -> Result<Url, ScrapeError> {
        let platform = utf8_percent_encode(platform, PATH_SEGMENT).to_string();
        let username = utf8_percent_encode(username, PATH_SEGMENT).to_string();
        let raw = self
            .settings
            .upstream_template
            .replace("{platform}", &platform)
            .replace("{username}", &username);
        Url::parse(&raw).map_err(|e| ScrapeError::NavigationFailed(format!("invalid target url {}: {}", raw, e)))
    }

    /// 新しいブラウザセッションで上流ページを開き、要素内の JSON を返す。
    ///
    /// 起動後はどの経路でも必ずセッションを閉じる。
    /// close の失敗はログに残すだけで結果は上書きしない
    pub async fn scrape(&self, platform: &str, username: &str) -> Result<Value, ScrapeError> {
        let url = self.target_url(platform, username)?;

        let _permit = match &self.limiter {
            Some(sem) => Some(
                Arc::clone(sem)
                    .acquire_owned()
                    .await
                    .map_err(|e| ScrapeError::SessionError(e.to_string()))?,
            ),
            None => None,
        };

        info!(%platform, %username, "[Scraper] Launching browser");
        let mut session = self.launcher.launch().await?;

        let result = self.extract(session.as_mut(), &url).await;

        info!(%platform, %username, "[Scraper] Closing browser");
        if let Err(e) = session.close().await {
            warn!(%platform, %username, "failed to release browser session: {}", e);
        }
        result
    }

    async fn extract(&self, session: &mut dyn Session, url: &Url) -> Result<Value, ScrapeError> {
        session.set_user_agent(&self.settings.user_agent).await?;

        info!(%url, "[Scraper] Navigating");
        // 通信が落ち着かないページでも navigation_timeout で打ち切る
        let limit = self.settings.navigation_timeout;
        tokio::time::timeout(limit, session.navigate(url, self.settings.idle))
            .await
            .map_err(|_| ScrapeError::NavigationFailed(format!("no response within {}ms", limit.as_millis())))??;

        let text = self.wait_for_text(session).await?;
        if text.trim().is_empty() {
            return Err(ScrapeError::ExtractionFailed);
        }

        Ok(serde_json::from_str(&text)?)
    }

    // 要素が現れるまでポーリング。上限を超えたら Timeout
    async fn wait_for_text(&self, session: &mut dyn Session) -> Result<String, ScrapeError> {
        let limit = self.settings.element_timeout;
        let selector = self.settings.selector.as_str();
        let poll = async {
            loop {
                if let Some(text) = session.element_text(selector).await? {
                    return Ok::<_, ScrapeError>(text);
                }
                tokio::time::sleep(ELEMENT_POLL).await;
            }
        };
        match tokio::time::timeout(limit, poll).await {
            Ok(found) => found,
            Err(_) => {
                debug!(selector, "content element did not appear");
                Err(ScrapeError::Timeout(limit))
            }
        }
    }
}
