use std::sync::Arc;

use chrono::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::{
    clock::Clock,
    config::Config,
    models::{SecurityEvent, ViolationType},
    store::{KeyValueStore, keys, set_json},
};

/// 安全事件日志，写入结构化日志并按时间有序保存到存储
#[derive(Clone)]
pub struct SecurityLog {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: Arc<Config>,
}

impl SecurityLog {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, config: Arc<Config>) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub async fn record(
        &self,
        violation_type: ViolationType,
        client_ip: &str,
        user_agent: &str,
        details: serde_json::Value,
    ) -> SecurityEvent {
        let event = SecurityEvent {
            id: Uuid::new_v4().to_string(),
            violation_type,
            client_ip: client_ip.to_string(),
            user_agent: user_agent.to_string(),
            details,
            timestamp: self.clock.now(),
        };

        warn!(
            violation_type = ?event.violation_type,
            client_ip = %event.client_ip,
            user_agent = %event.user_agent,
            details = %event.details,
            "Security event"
        );

        let key = keys::security_event_key(event.timestamp.timestamp_millis(), &event.id);
        if let Err(e) = set_json(
            self.store.as_ref(),
            &key,
            &event,
            Some(self.config.security_event_ttl()),
        )
        .await
        {
            warn!(error = %e, "Failed to persist security event");
        }

        event
    }

    /// 最近 `timeframe` 内的事件，新的在前；存储不可用时返回空
    pub async fn recent(&self, timeframe: Duration) -> Vec<SecurityEvent> {
        let since = self.clock.now() - timeframe;
        match self.store.list(keys::SECURITY_EVENT_PREFIX).await {
            Ok(entries) => {
                let mut events: Vec<SecurityEvent> = entries
                    .into_iter()
                    .filter_map(|(_, json)| serde_json::from_str::<SecurityEvent>(&json).ok())
                    .filter(|event| event.timestamp >= since)
                    .collect();
                events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
                events
            }
            Err(e) => {
                warn!(error = %e, "Failed to list security events");
                Vec::new()
            }
        }
    }
}
