use std::sync::Arc;

use cache::ResponseCache;
use clock::Clock;
use config::Config;
use middleware::{AdmissionMiddleware, InputValidator, RateLimiter, SecurityLog};
use store::KeyValueStore;
use upstream::Answerer;

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod middleware;
pub mod models;
pub mod router;
pub mod routes;
pub mod store;
pub mod upstream;
pub mod utils;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub limiter: RateLimiter,
    pub cache: ResponseCache,
    pub validator: InputValidator,
    pub security_log: SecurityLog,
    pub admission: AdmissionMiddleware,
    pub answerer: Arc<dyn Answerer>,
}

impl AppState {
    /// 所有组件共享同一个存储与时钟
    pub fn new(
        config: Config,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        answerer: Arc<dyn Answerer>,
    ) -> Self {
        let config = Arc::new(config);
        let limiter = RateLimiter::new(store.clone(), clock.clone(), config.clone());
        let cache = ResponseCache::new(store.clone(), clock.clone(), config.clone());
        let validator = InputValidator::new(config.clone());
        let security_log = SecurityLog::new(store, clock, config.clone());
        let admission = AdmissionMiddleware::new(
            limiter.clone(),
            validator.clone(),
            security_log.clone(),
            config.clone(),
        );

        Self {
            config,
            limiter,
            cache,
            validator,
            security_log,
            admission,
            answerer,
        }
    }
}
