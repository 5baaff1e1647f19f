use std::sync::Arc;

use kurosabi::context::ContextMiddleware;

use crate::scrape::Scraper;

/// 全ハンドラで共有するコンテキスト（可変状態は持たない）
#[derive(Clone)]
pub struct RelayContext {
    pub scraper: Arc<Scraper>,
}

impl RelayContext {
    pub fn new(scraper: Scraper) -> Self {
        Self {
            scraper: Arc::new(scraper),
        }
    }
}

impl ContextMiddleware<RelayContext> for RelayContext {
}
