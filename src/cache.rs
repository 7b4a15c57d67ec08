//! Short-TTL JSON cache and per-user rate limiting
//!
//! Both live in the relational store: cached values in `kv_cache`, counters
//! in `rate_counters` with atomic UPSERT increments. Cache failures never
//! fail a request; callers recompute on miss.

use crate::config::{CacheConfig, RateLimitConfig};
use crate::db::{now_str, Database};
use crate::error::Result;
use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// JSON cache with TTL plus per-user usage counters
#[derive(Debug, Clone)]
pub struct CacheService {
    db: Database,
    config: CacheConfig,
    limits: RateLimitConfig,
}

/// Current per-user usage and limits, for dashboards
#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub upload_today: i64,
    pub upload_limit_per_day: i64,
    pub conversation_today: i64,
    pub conversation_limit_per_day: i64,
    pub search_current_second: i64,
    pub search_qps_limit: f64,
}

impl CacheService {
    pub fn new(db: Database, config: CacheConfig, limits: RateLimitConfig) -> Self {
        Self { db, config, limits }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    /// Read a cached JSON value. Misses, expiry, and errors all yield `None`.
    pub async fn get(&self, key: &str) -> Option<Value> {
        if !self.config.enabled {
            return None;
        }
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT value, expires_at FROM kv_cache WHERE key = ?1")
                .bind(self.full_key(key))
                .fetch_optional(self.db.pool())
                .await
                .ok()?;
        let (value, expires_at) = row?;
        let expires = chrono::DateTime::parse_from_rfc3339(&expires_at).ok()?;
        if expires < Utc::now() {
            let _ = self.delete(key).await;
            return None;
        }
        serde_json::from_str(&value).ok()
    }

    /// Write a JSON value with a TTL in seconds. Errors are swallowed; a
    /// cold cache is always safe.
    pub async fn set(&self, key: &str, value: &Value, ttl_secs: i64) -> bool {
        if !self.config.enabled {
            return false;
        }
        let expires = (Utc::now() + Duration::seconds(ttl_secs)).to_rfc3339();
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(_) => return false,
        };
        sqlx::query(
            r#"
            INSERT INTO kv_cache (key, value, expires_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
            "#,
        )
        .bind(self.full_key(key))
        .bind(raw)
        .bind(expires)
        .execute(self.db.pool())
        .await
        .is_ok()
    }

    /// Delete one key
    pub async fn delete(&self, key: &str) -> bool {
        sqlx::query("DELETE FROM kv_cache WHERE key = ?1")
            .bind(self.full_key(key))
            .execute(self.db.pool())
            .await
            .is_ok()
    }

    /// Delete every key under a prefix (e.g. all list pages for a user).
    /// Returns the number of deleted entries.
    pub async fn delete_by_prefix(&self, prefix: &str) -> u64 {
        let pattern = format!("{}%", self.full_key(prefix).replace('%', ""));
        match sqlx::query("DELETE FROM kv_cache WHERE key LIKE ?1")
            .bind(pattern)
            .execute(self.db.pool())
            .await
        {
            Ok(result) => result.rows_affected(),
            Err(e) => {
                debug!("prefix invalidation failed for {}: {}", prefix, e);
                0
            }
        }
    }

    async fn incr(&self, key: &str, ttl_secs: i64) -> Result<i64> {
        // Drop dead buckets opportunistically so the table stays small
        sqlx::query("DELETE FROM rate_counters WHERE expires_at < ?1")
            .bind(now_str())
            .execute(self.db.pool())
            .await?;
        let expires = (Utc::now() + Duration::seconds(ttl_secs)).to_rfc3339();
        let count: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO rate_counters (key, count, expires_at) VALUES (?1, 1, ?2)
            ON CONFLICT(key) DO UPDATE SET count = count + 1
            RETURNING count
            "#,
        )
        .bind(key)
        .bind(expires)
        .fetch_one(self.db.pool())
        .await?;
        Ok(count)
    }

    async fn read_counter(&self, key: &str) -> i64 {
        sqlx::query_scalar("SELECT count FROM rate_counters WHERE key = ?1 AND expires_at >= ?2")
            .bind(key)
            .bind(now_str())
            .fetch_optional(self.db.pool())
            .await
            .ok()
            .flatten()
            .unwrap_or(0)
    }

    fn day_bucket() -> String {
        Utc::now().format("%Y-%m-%d").to_string()
    }

    /// Count an upload against the user's daily budget.
    /// Returns `(allowed, current_count, limit)`.
    pub async fn check_and_incr_upload(&self, user_id: i64) -> (bool, i64, i64) {
        let limit = self.limits.upload_per_day;
        if !self.limits.enabled {
            return (true, 0, limit);
        }
        let key = format!("rate:upload:user:{}:day:{}", user_id, Self::day_bucket());
        match self.incr(&key, 86_400 * 2).await {
            Ok(n) => (n <= limit, n, limit),
            Err(_) => (true, 0, limit),
        }
    }

    /// Count a conversation message against the user's daily budget.
    pub async fn check_and_incr_conversation(&self, user_id: i64) -> (bool, i64, i64) {
        let limit = self.limits.conversation_per_day;
        if !self.limits.enabled {
            return (true, 0, limit);
        }
        let key = format!("rate:chat:user:{}:day:{}", user_id, Self::day_bucket());
        match self.incr(&key, 86_400 * 2).await {
            Ok(n) => (n <= limit, n, limit),
            Err(_) => (true, 0, limit),
        }
    }

    /// Count a search against the user's per-second budget.
    pub async fn check_and_incr_search_qps(&self, user_id: i64) -> (bool, i64, f64) {
        let limit_qps = self.limits.search_qps;
        if !self.limits.enabled {
            return (true, 0, limit_qps);
        }
        let limit = if limit_qps >= 1.0 { limit_qps as i64 } else { 1 };
        let sec = Utc::now().timestamp();
        let key = format!("rate:search:user:{}:sec:{}", user_id, sec);
        match self.incr(&key, 2).await {
            Ok(n) => (n <= limit, n, limit_qps),
            Err(_) => (true, 0, limit_qps),
        }
    }

    /// Current usage counters and limits for one user
    pub async fn usage_snapshot(&self, user_id: i64) -> UsageSnapshot {
        let day = Self::day_bucket();
        let sec = Utc::now().timestamp();
        UsageSnapshot {
            upload_today: self
                .read_counter(&format!("rate:upload:user:{}:day:{}", user_id, day))
                .await,
            upload_limit_per_day: self.limits.upload_per_day,
            conversation_today: self
                .read_counter(&format!("rate:chat:user:{}:day:{}", user_id, day))
                .await,
            conversation_limit_per_day: self.limits.conversation_per_day,
            search_current_second: self
                .read_counter(&format!("rate:search:user:{}:sec:{}", user_id, sec))
                .await,
            search_qps_limit: self.limits.search_qps,
        }
    }

    // ---- canonical key layout, shared so invalidation stays grouped ---- //

    pub fn key_dashboard_stats(user_id: i64) -> String {
        format!("stats:user:{}", user_id)
    }

    pub fn key_usage_limits(user_id: i64) -> String {
        format!("usage_limits:user:{}", user_id)
    }

    pub fn key_kb_list(user_id: i64, page: i64, page_size: i64) -> String {
        format!("kb:list:user:{}:p:{}:ps:{}", user_id, page, page_size)
    }

    pub fn key_kb_detail(kb_id: i64) -> String {
        format!("kb:detail:{}", kb_id)
    }

    pub fn key_conv_list(user_id: i64, page: i64, page_size: i64) -> String {
        format!("conv:list:user:{}:p:{}:ps:{}", user_id, page, page_size)
    }

    pub fn key_conv_detail(conv_id: i64) -> String {
        format!("conv:detail:{}", conv_id)
    }

    pub fn key_file_list(user_id: i64, page: i64, page_size: i64) -> String {
        format!("file:list:user:{}:p:{}:ps:{}", user_id, page, page_size)
    }

    pub fn prefix_user_kb_list(user_id: i64) -> String {
        format!("kb:list:user:{}:", user_id)
    }

    pub fn prefix_user_conv_list(user_id: i64) -> String {
        format!("conv:list:user:{}:", user_id)
    }

    pub fn prefix_user_file_list(user_id: i64) -> String {
        format!("file:list:user:{}:", user_id)
    }

    /// Conversation or message mutated: drop its detail, the user's
    /// conversation list pages, and the user's dashboard snapshots.
    pub async fn invalidate_conversation(&self, user_id: i64, conv_id: i64) {
        self.delete(&Self::key_conv_detail(conv_id)).await;
        self.delete_by_prefix(&Self::prefix_user_conv_list(user_id))
            .await;
        self.delete(&Self::key_dashboard_stats(user_id)).await;
        self.delete(&Self::key_usage_limits(user_id)).await;
    }

    /// Knowledge base mutated: drop its detail, the user's KB list pages,
    /// and the dashboard snapshot.
    pub async fn invalidate_knowledge_base(&self, user_id: i64, kb_id: i64) {
        self.delete(&Self::key_kb_detail(kb_id)).await;
        self.delete_by_prefix(&Self::prefix_user_kb_list(user_id))
            .await;
        self.delete(&Self::key_dashboard_stats(user_id)).await;
    }

    /// File set mutated: drop the user's file list pages and the dashboard
    /// snapshot.
    pub async fn invalidate_files(&self, user_id: i64) {
        self.delete_by_prefix(&Self::prefix_user_file_list(user_id))
            .await;
        self.delete(&Self::key_dashboard_stats(user_id)).await;
    }
}
