mod config;
mod error;
mod route;
mod scrape;
mod session;

use std::sync::Arc;

use kurosabi::Kurosabi;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

pub mod context;
use crate::{
    config::Config,
    context::RelayContext,
    route::{Body, Reply},
    scrape::Scraper,
    session::ChromeLauncher,
};

// Reply をレスポンスに書き出す
macro_rules! respond {
    ($c:expr, $reply:expr) => {{
        let reply: Reply = $reply;
        match &reply.body {
            Body::Json(v) => {
                $c.res.json_value(v);
            }
            Body::Text(t) => {
                $c.res.text(*t);
            }
        }
        $c.res.set_status(reply.status);
    }};
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Logger initialized");

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let launcher = Arc::new(ChromeLauncher::new(config.browser.clone()));
    let scraper = Scraper::new(launcher, config.scrape.clone());
    let mut kurosabi = Kurosabi::with_context(RelayContext::new(scraper));

    kurosabi.get("/", |mut c| async move {
        respond!(c, Reply::alive());
        c
    });

    // 例: /scrape/epic/King-Tet
    kurosabi.get("/scrape/*", |mut c| async move {
        let scraper = c.c.scraper.clone();
        let path = c.req.path.path.clone();
        let reply = route::scrape_reply(&scraper, &path).await;
        respond!(c, reply);
        c
    });

    // /scrape や /scrape/ はワイルドカードに掛からないのでここで 400 を返す。
    // メソッド違いもここに来るので GET 以外は 404
    kurosabi.not_found_handler(|mut c| async move {
        let scraper = c.c.scraper.clone();
        let method = format!("{:?}", c.req.method);
        let path = c.req.path.path.clone();
        let reply = route::fallback_reply(&scraper, &method, &path).await;
        respond!(c, reply);
        c
    });

    info!("Scraper service listening on http://{}:{}", config.host, config.port);
    kurosabi
        .server()
        .port(config.port)
        .host(config.host.octets())
        .build()
        .run_async()
        .await;
}
