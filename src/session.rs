use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::network::{
    EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent, SetUserAgentOverrideParams,
};
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use crate::config::{BrowserSettings, IdlePolicy};
use crate::error::ScrapeError;

const IDLE_POLL: Duration = Duration::from_millis(50);

/// 1回のスクレイプ専用のブラウザセッション
#[async_trait]
pub trait Session: Send {
    async fn set_user_agent(&mut self, user_agent: &str) -> Result<(), ScrapeError>;

    /// `url` を開き、`idle` の条件で通信が落ち着くまで待つ
    async fn navigate(&mut self, url: &Url, idle: IdlePolicy) -> Result<(), ScrapeError>;

    /// 要素がまだ無ければ `None`、あればそのテキスト（空文字もあり得る）
    async fn element_text(&mut self, selector: &str) -> Result<Option<String>, ScrapeError>;

    /// セッションを破棄する。2回目以降は何もしない
    async fn close(&mut self) -> Result<(), ScrapeError>;
}

#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn Session>, ScrapeError>;
}

/// ヘッドレス Chromium を毎回新規に起動するランチャ
pub struct ChromeLauncher {
    settings: BrowserSettings,
}

impl ChromeLauncher {
    pub fn new(settings: BrowserSettings) -> Self {
        Self { settings }
    }

    // 同時起動でプロファイルロックが衝突しないよう、セッション毎に別ディレクトリを使う
    fn profile_dir() -> std::io::Result<PathBuf> {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let dir = std::env::temp_dir().join(format!(
            "stats-scrape-relay-{}-{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

#[async_trait]
impl SessionLauncher for ChromeLauncher {
    async fn launch(&self) -> Result<Box<dyn Session>, ScrapeError> {
        let profile_dir = Self::profile_dir()
            .map_err(|e| ScrapeError::SessionError(format!("failed to create profile dir: {}", e)))?;

        let mut builder = BrowserConfig::builder().user_data_dir(&profile_dir);
        if let Some(exe) = &self.settings.executable {
            builder = builder.chrome_executable(exe);
        }
        if self.settings.no_sandbox {
            builder = builder.no_sandbox();
        }
        let config = match builder.build() {
            Ok(c) => c,
            Err(e) => {
                remove_profile_dir(&profile_dir);
                return Err(ScrapeError::SessionError(format!("invalid browser config: {}", e)));
            }
        };

        let (browser, mut handler) = match Browser::launch(config).await {
            Ok(pair) => pair,
            Err(e) => {
                remove_profile_dir(&profile_dir);
                return Err(ScrapeError::SessionError(format!("failed to launch browser: {}", e)));
            }
        };

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("browser handler event error: {}", e);
                }
            }
        });

        let mut session = ChromeSession {
            browser,
            page: None,
            handler_task,
            profile_dir: Some(profile_dir),
            closed: false,
        };

        match session.browser.new_page("about:blank").await {
            Ok(page) => session.page = Some(page),
            Err(e) => {
                if let Err(close_err) = session.close().await {
                    warn!("failed to release browser after page error: {}", close_err);
                }
                return Err(ScrapeError::SessionError(format!("failed to open page: {}", e)));
            }
        }

        Ok(Box::new(session))
    }
}

pub struct ChromeSession {
    browser: Browser,
    page: Option<Page>,
    handler_task: JoinHandle<()>,
    profile_dir: Option<PathBuf>,
    closed: bool,
}

impl ChromeSession {
    fn page(&self) -> Result<&Page, ScrapeError> {
        self.page
            .as_ref()
            .ok_or_else(|| ScrapeError::SessionError("session has no open page".to_string()))
    }
}

#[async_trait]
impl Session for ChromeSession {
    async fn set_user_agent(&mut self, user_agent: &str) -> Result<(), ScrapeError> {
        self.page()?
            .set_user_agent(user_agent_override(user_agent))
            .await
            .map_err(|e| ScrapeError::SessionError(format!("failed to set user agent: {}", e)))?;
        Ok(())
    }

    async fn navigate(&mut self, url: &Url, idle: IdlePolicy) -> Result<(), ScrapeError> {
        let page = self.page()?;
        // goto より前に購読しておかないと初期リクエストを取りこぼす
        let tracker = InflightTracker::attach(page).await?;
        page.goto(url.as_str())
            .await
            .map_err(|e| ScrapeError::NavigationFailed(e.to_string()))?;
        tracker.wait_idle(idle).await;
        Ok(())
    }

    async fn element_text(&mut self, selector: &str) -> Result<Option<String>, ScrapeError> {
        let page = self.page()?;
        let element = match page.find_element(selector).await {
            Ok(el) => el,
            Err(e) => {
                let msg = e.to_string();
                if is_missing_node(&msg) {
                    debug!(selector, "element not present yet: {}", msg);
                    return Ok(None);
                }
                return Err(ScrapeError::SessionError(format!("failed to query {}: {}", selector, msg)));
            }
        };
        let text = element
            .inner_text()
            .await
            .map_err(|e| ScrapeError::SessionError(format!("failed to read element text: {}", e)))?;
        Ok(Some(text.unwrap_or_default()))
    }

    async fn close(&mut self) -> Result<(), ScrapeError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let result = match self.browser.close().await {
            Ok(_) => {
                if let Err(e) = self.browser.wait().await {
                    warn!("browser process did not exit cleanly: {}", e);
                }
                Ok(())
            }
            Err(e) => {
                // close に失敗したらプロセスを直接落とす
                if let Some(Err(kill_err)) = self.browser.kill().await {
                    warn!("failed to kill browser process: {}", kill_err);
                }
                Err(ScrapeError::SessionError(format!("failed to close browser: {}", e)))
            }
        };
        self.page = None;
        self.handler_task.abort();
        if let Some(dir) = self.profile_dir.take() {
            remove_profile_dir(&dir);
        }
        result
    }
}

impl Drop for ChromeSession {
    fn drop(&mut self) {
        // Browser 自体の Drop が子プロセスを kill する。ここでは残りを片付けるだけ
        self.handler_task.abort();
        if let Some(dir) = self.profile_dir.take() {
            if !self.closed {
                warn!("browser session dropped without close");
            }
            remove_profile_dir(&dir);
        }
    }
}

// UA の上書きは Network ドメインの型で渡す
fn user_agent_override(user_agent: &str) -> SetUserAgentOverrideParams {
    SetUserAgentOverrideParams::new(user_agent)
}

// find_element のエラーのうち「まだ要素が無い」ものだけを判定する
fn is_missing_node(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    m.contains("could not find node") || m.contains("no node") || m.contains("not found")
}

fn remove_profile_dir(dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        debug!("failed to remove profile dir {}: {}", dir.display(), e);
    }
}

/// 通信中のリクエストIDの集合と、networkidle2 相当の待機
#[derive(Clone, Default)]
pub struct InflightSet {
    ids: Arc<Mutex<HashSet<String>>>,
}

impl InflightSet {
    pub fn started(&self, id: &str) {
        if let Ok(mut s) = self.ids.lock() {
            s.insert(id.to_string());
        }
    }

    pub fn finished(&self, id: &str) {
        if let Ok(mut s) = self.ids.lock() {
            s.remove(id);
        }
    }

    pub fn count(&self) -> usize {
        self.ids.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// 通信中が `max_inflight` 以下の状態が `window` 続くまで待つ。
    /// 上限を超えた時点で計測をやり直す
    pub async fn wait_idle(&self, idle: IdlePolicy) {
        let mut quiet_since: Option<Instant> = None;
        loop {
            if self.count() <= idle.max_inflight {
                let since = *quiet_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= idle.window {
                    return;
                }
            } else {
                quiet_since = None;
            }
            tokio::time::sleep(IDLE_POLL).await;
        }
    }
}

/// CDP の Network イベントを InflightSet に流し込む
struct InflightTracker {
    set: InflightSet,
    tasks: Vec<JoinHandle<()>>,
}

impl InflightTracker {
    async fn attach(page: &Page) -> Result<Self, ScrapeError> {
        let listen_err =
            |e: chromiumoxide::error::CdpError| ScrapeError::SessionError(format!("failed to watch network: {}", e));

        let mut sent = page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(listen_err)?;
        let mut finished = page
            .event_listener::<EventLoadingFinished>()
            .await
            .map_err(listen_err)?;
        let mut failed = page
            .event_listener::<EventLoadingFailed>()
            .await
            .map_err(listen_err)?;

        let set = InflightSet::default();

        let s = set.clone();
        let on_sent = tokio::spawn(async move {
            while let Some(ev) = sent.next().await {
                s.started(ev.request_id.inner());
            }
        });
        let s = set.clone();
        let on_finished = tokio::spawn(async move {
            while let Some(ev) = finished.next().await {
                s.finished(ev.request_id.inner());
            }
        });
        let s = set.clone();
        let on_failed = tokio::spawn(async move {
            while let Some(ev) = failed.next().await {
                s.finished(ev.request_id.inner());
            }
        });

        Ok(Self {
            set,
            tasks: vec![on_sent, on_finished, on_failed],
        })
    }

    async fn wait_idle(&self, idle: IdlePolicy) {
        self.set.wait_idle(idle).await
    }
}

impl Drop for InflightTracker {
    fn drop(&mut self) {
        for t in &self.tasks {
            t.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> IdlePolicy {
        IdlePolicy::default()
    }

    fn set_with(n: usize) -> InflightSet {
        let set = InflightSet::default();
        for i in 0..n {
            set.started(&format!("req-{}", i));
        }
        set
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_page_still_waits_a_full_window() {
        let set = InflightSet::default();
        let started = Instant::now();
        set.wait_idle(policy()).await;
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(500), "{:?}", waited);
        assert!(waited < Duration::from_millis(600), "{:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn two_open_requests_count_as_idle() {
        let set = set_with(2);
        let started = Instant::now();
        set.wait_idle(policy()).await;
        assert!(started.elapsed() < Duration::from_millis(600));
        assert_eq!(set.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_after_third_request_finishes() {
        let set = set_with(3);
        let s = set.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            s.finished("req-2");
        });
        let started = Instant::now();
        set.wait_idle(policy()).await;
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(1500), "{:?}", waited);
        assert!(waited < Duration::from_millis(1600), "{:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn third_request_restarts_the_window() {
        let set = set_with(2);
        let s = set.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            s.started("late");
            tokio::time::sleep(Duration::from_millis(700)).await;
            s.finished("late");
        });
        let started = Instant::now();
        set.wait_idle(policy()).await;
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(1500), "{:?}", waited);
        assert!(waited < Duration::from_millis(1600), "{:?}", waited);
    }

    #[test]
    fn duplicate_finish_is_harmless() {
        let set = set_with(1);
        set.finished("req-0");
        set.finished("req-0");
        set.finished("unknown");
        assert_eq!(set.count(), 0);
    }

    #[test]
    fn user_agent_override_carries_string() {
        let params = user_agent_override("Mozilla/5.0 test");
        assert_eq!(params.user_agent, "Mozilla/5.0 test");
    }

    #[test]
    fn only_missing_node_errors_mean_absent() {
        assert!(is_missing_node("Could not find node with given id"));
        assert!(is_missing_node("Not found"));
        assert!(!is_missing_node("Request timed out."));
        assert!(!is_missing_node("channel closed"));
    }
}
