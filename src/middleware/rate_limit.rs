//! 多层固定窗口限流
//!
//! 一次请求同时检查多层配额：客户端分钟/小时/天，单操作分钟/小时，
//! 以及按标记启用的高强度层与附件层。所有层先检查、全部通过后才写入计数，
//! 被某一层拒绝的请求不会消耗其他层的配额。
//!
//! 检查与写入是两次存储往返，同一客户端的并发请求可能在两者之间交错，
//! 造成短暂的超额放行。这里有意保留两阶段：单次原子自增无法在拒绝时
//! 不消耗已通过层的配额，而窗口内的计数从不回退。

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::{
    clock::Clock,
    config::Config,
    models::{
        BlockRecord, Decision, IpStatus, OperationFlags, RateWindowCounter, TierStatus,
        ViolationRecord,
    },
    store::{KeyValueStore, StoreError, get_json, keys, set_json},
};

/// 存储不可用时放行并返回的名义剩余次数
pub const FAIL_OPEN_REMAINING: u32 = 999_999;

pub const BLOCK_REASON: &str = "excessive violations";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierWindow {
    Minute,
    Hour,
    Day,
}

impl TierWindow {
    pub fn as_str(&self) -> &'static str {
        match self {
            TierWindow::Minute => "minute",
            TierWindow::Hour => "hour",
            TierWindow::Day => "day",
        }
    }

    pub fn length(&self) -> Duration {
        match self {
            TierWindow::Minute => Duration::minutes(1),
            TierWindow::Hour => Duration::hours(1),
            TierWindow::Day => Duration::days(1),
        }
    }
}

/// 一条独立的（窗口长度，上限）限流规则
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tier {
    pub scope: String,
    pub window: TierWindow,
    pub max_requests: u32,
}

impl Tier {
    fn new(scope: impl Into<String>, window: TierWindow, max_requests: u32) -> Self {
        Self {
            scope: scope.into(),
            window,
            max_requests,
        }
    }

    pub fn name(&self) -> String {
        format!("{}:{}", self.scope, self.window.as_str())
    }

    fn key(&self, client_id: &str) -> String {
        keys::rate_window_key(&self.scope, client_id, self.window.as_str())
    }
}

/// 检查阶段对单层的判定
struct TierCheck {
    tier: Tier,
    key: String,
    // 本窗口内已计入的次数，过期窗口按 0 计
    current: u32,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
}

impl TierCheck {
    fn exceeds(&self) -> bool {
        self.current.saturating_add(1) > self.tier.max_requests
    }
}

fn seconds_until(now: DateTime<Utc>, at: DateTime<Utc>) -> u64 {
    let millis = (at - now).num_milliseconds().max(0) as u64;
    millis.div_ceil(1000)
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: Arc<Config>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, config: Arc<Config>) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// 本次请求适用的所有层，按检查顺序排列
    pub fn tiers_for(&self, operation: &str, flags: OperationFlags) -> Vec<Tier> {
        let limits = &self.config.rate_limits;
        let operation_scope = format!("op:{}", operation);

        let mut tiers = vec![
            Tier::new("client", TierWindow::Minute, limits.client_per_minute),
            Tier::new("client", TierWindow::Hour, limits.client_per_hour),
            Tier::new("client", TierWindow::Day, limits.client_per_day),
            Tier::new(operation_scope.clone(), TierWindow::Minute, limits.operation_per_minute),
            Tier::new(operation_scope, TierWindow::Hour, limits.operation_per_hour),
        ];
        if flags.intensive {
            tiers.push(Tier::new("intensive", TierWindow::Minute, limits.intensive_per_minute));
            tiers.push(Tier::new("intensive", TierWindow::Hour, limits.intensive_per_hour));
        }
        if flags.has_attachment {
            tiers.push(Tier::new("attachment", TierWindow::Minute, limits.attachment_per_minute));
            tiers.push(Tier::new("attachment", TierWindow::Hour, limits.attachment_per_hour));
        }
        tiers
    }

    /// 判定并计数；存储不可用时放行
    pub async fn evaluate(&self, client_id: &str, operation: &str, flags: OperationFlags) -> Decision {
        match self.try_evaluate(client_id, operation, flags).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(
                    client_id = %client_id,
                    operation = %operation,
                    error = %e,
                    "Rate limiter store unavailable, failing open"
                );
                Decision {
                    allowed: true,
                    remaining: FAIL_OPEN_REMAINING,
                    limit: FAIL_OPEN_REMAINING,
                    reset_at: self.clock.now() + Duration::minutes(1),
                    retry_after: None,
                    tier: None,
                }
            }
        }
    }

    async fn try_evaluate(
        &self,
        client_id: &str,
        operation: &str,
        flags: OperationFlags,
    ) -> Result<Decision, StoreError> {
        let now = self.clock.now();

        // 检查阶段：不写任何计数
        let mut checks = Vec::new();
        for tier in self.tiers_for(operation, flags) {
            let check = self.check_tier(tier, client_id, now).await?;
            if check.exceeds() {
                return Ok(self.reject(client_id, check, now).await);
            }
            checks.push(check);
        }

        // 写入阶段
        let mut tightest: Option<(u32, u32, DateTime<Utc>)> = None;
        for check in &checks {
            let counter = RateWindowCounter {
                count: check.current + 1,
                window_start: check.window_start,
                window_end: check.window_end,
            };
            let ttl = (check.window_end - now)
                .to_std()
                .unwrap_or(StdDuration::from_secs(1));
            set_json(self.store.as_ref(), &check.key, &counter, Some(ttl)).await?;

            let remaining = check.tier.max_requests - counter.count;
            if tightest.is_none_or(|(r, _, _)| remaining < r) {
                tightest = Some((remaining, check.tier.max_requests, check.window_end));
            }
        }

        let (remaining, limit, reset_at) =
            tightest.unwrap_or((FAIL_OPEN_REMAINING, FAIL_OPEN_REMAINING, now));
        debug!(client_id = %client_id, operation = %operation, remaining, "Request admitted");

        Ok(Decision {
            allowed: true,
            remaining,
            limit,
            reset_at,
            retry_after: None,
            tier: None,
        })
    }

    async fn check_tier(
        &self,
        tier: Tier,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TierCheck, StoreError> {
        let key = tier.key(client_id);
        let stored: Option<RateWindowCounter> = get_json(self.store.as_ref(), &key).await?;

        let check = match stored {
            Some(counter) if counter.is_open(now) => TierCheck {
                tier,
                key,
                current: counter.count,
                window_start: counter.window_start,
                window_end: counter.window_end,
            },
            // 过期或不存在：从当前时刻开启新窗口
            _ => {
                let window_end = now + tier.window.length();
                TierCheck {
                    tier,
                    key,
                    current: 0,
                    window_start: now,
                    window_end,
                }
            }
        };
        Ok(check)
    }

    async fn reject(&self, client_id: &str, check: TierCheck, now: DateTime<Utc>) -> Decision {
        let tier_name = check.tier.name();
        warn!(
            client_id = %client_id,
            tier = %tier_name,
            limit = check.tier.max_requests,
            "Rate limit exceeded"
        );

        if let Err(e) = self.record_violation(client_id, now).await {
            warn!(client_id = %client_id, error = %e, "Failed to record rate limit violation");
        }

        Decision {
            allowed: false,
            remaining: 0,
            limit: check.tier.max_requests,
            reset_at: check.window_end,
            retry_after: Some(seconds_until(now, check.window_end).max(1)),
            tier: Some(tier_name),
        }
    }

    /// 每次拒绝计一次违规，达到阈值后封禁
    async fn record_violation(&self, ip: &str, now: DateTime<Utc>) -> Result<ViolationRecord, StoreError> {
        let key = keys::violation_key(ip);
        let mut record = get_json::<ViolationRecord>(self.store.as_ref(), &key)
            .await?
            .unwrap_or(ViolationRecord {
                violation_count: 0,
                block_count: 0,
                last_violation_at: now,
            });

        record.violation_count += 1;
        record.last_violation_at = now;

        if record.violation_count >= self.config.violation_threshold {
            self.block(ip, now).await?;
            record.block_count += 1;
            warn!(
                client_ip = %ip,
                violations = record.violation_count,
                blocks = record.block_count,
                "Blocking IP after repeated violations"
            );
        }

        set_json(
            self.store.as_ref(),
            &key,
            &record,
            Some(self.config.violation_ttl()),
        )
        .await?;
        Ok(record)
    }

    async fn block(&self, ip: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let duration = self.config.block_duration();
        let record = BlockRecord {
            ip: ip.to_string(),
            blocked_at: now,
            expires_at: now + Duration::from_std(duration).unwrap_or(Duration::hours(1)),
            reason: BLOCK_REASON.to_string(),
        };
        set_json(self.store.as_ref(), &keys::block_key(ip), &record, Some(duration)).await
    }

    /// 当前生效的封禁记录；存储不可用时视为未封禁
    pub async fn block_status(&self, ip: &str) -> Option<BlockRecord> {
        let now = self.clock.now();
        let key = keys::block_key(ip);
        match get_json::<BlockRecord>(self.store.as_ref(), &key).await {
            Ok(Some(record)) if record.is_active(now) => Some(record),
            Ok(Some(_)) => {
                // 存储 TTL 漂移留下的过期记录
                let _ = self.store.delete(&key).await;
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(client_ip = %ip, error = %e, "Block check failed, treating as not blocked");
                None
            }
        }
    }

    pub async fn is_blocked(&self, ip: &str) -> bool {
        self.block_status(ip).await.is_some()
    }

    /// 只读查询各层配额，不计数
    pub async fn quota_status(
        &self,
        client_id: &str,
        operation: &str,
        flags: OperationFlags,
    ) -> Vec<TierStatus> {
        let now = self.clock.now();
        let mut statuses = Vec::new();

        for tier in self.tiers_for(operation, flags) {
            let counter = match get_json::<RateWindowCounter>(self.store.as_ref(), &tier.key(client_id)).await {
                Ok(counter) => counter.filter(|c| c.is_open(now)),
                Err(e) => {
                    warn!(client_id = %client_id, error = %e, "Quota status unavailable");
                    return Vec::new();
                }
            };
            let used = counter.as_ref().map_or(0, |c| c.count);
            statuses.push(TierStatus {
                tier: tier.name(),
                limit: tier.max_requests,
                used,
                remaining: tier.max_requests.saturating_sub(used),
                reset_at: counter.map(|c| c.window_end),
            });
        }

        statuses
    }

    pub async fn ip_status(&self, ip: &str) -> IpStatus {
        let block = self.block_status(ip).await;
        let violations = get_json::<ViolationRecord>(self.store.as_ref(), &keys::violation_key(ip))
            .await
            .unwrap_or_else(|e| {
                warn!(client_ip = %ip, error = %e, "Violation lookup failed");
                None
            });

        IpStatus {
            ip: ip.to_string(),
            blocked: block.is_some(),
            block,
            violations,
        }
    }

    /// 当前所有生效的封禁
    pub async fn blocked_ips(&self) -> Vec<BlockRecord> {
        let now = self.clock.now();
        match self.store.list(keys::BLOCK_PREFIX).await {
            Ok(entries) => entries
                .into_iter()
                .filter_map(|(_, json)| serde_json::from_str::<BlockRecord>(&json).ok())
                .filter(|record| record.is_active(now))
                .collect(),
            Err(e) => {
                warn!(error = %e, "Failed to list blocked IPs");
                Vec::new()
            }
        }
    }

    /// 解除封禁并清空违规记录，返回此前是否处于封禁
    pub async fn unblock(&self, ip: &str) -> Result<bool, StoreError> {
        let was_blocked = self.is_blocked(ip).await;
        self.store.delete(&keys::block_key(ip)).await?;
        self.store.delete(&keys::violation_key(ip)).await?;
        tracing::info!(client_ip = %ip, was_blocked, "IP unblocked");
        Ok(was_blocked)
    }

    /// 删除窗口已结束的计数，返回删除数量
    pub async fn cleanup_counters(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut removed = 0;

        for (key, json) in self.store.list(keys::RATE_LIMIT_PREFIX).await? {
            let stale = serde_json::from_str::<RateWindowCounter>(&json)
                .map(|counter| !counter.is_open(now))
                .unwrap_or(true);
            if stale {
                self.store.delete(&key).await?;
                removed += 1;
            }
        }

        tracing::info!(removed, "Rate limit counters cleaned up");
        Ok(removed)
    }
}
