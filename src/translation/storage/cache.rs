//! 翻译缓存
//!
//! 键为 `tc:` 加 blake3(语言 + 规整后文本) 的前 32 位十六进制。
//! 内存中有一层 LRU，后端为任意 `CacheStore`。存储错误一律按未命中处理。

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use lru::LruCache;

use super::store::{CacheEntry, CacheStore, MemoryStore, RedbStore};
use crate::translation::config::{constants, TranslationConfig};
use crate::translation::error::TranslationResult;

// ============================================================================
// 配置与统计
// ============================================================================

/// 缓存配置
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub expiry: Duration,
    pub memory_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            expiry: Duration::from_secs(constants::DEFAULT_CACHE_EXPIRY_DAYS * 24 * 60 * 60),
            memory_capacity: constants::DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl From<&TranslationConfig> for CacheConfig {
    fn from(config: &TranslationConfig) -> Self {
        Self {
            expiry: config.cache_expiry(),
            memory_capacity: config.cache_capacity,
        }
    }
}

/// 缓存统计信息
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub purged: u64,
    pub store_errors: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct AtomicCacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    purged: AtomicU64,
    store_errors: AtomicU64,
}

// ============================================================================
// 文本规整
// ============================================================================

/// 去首尾空白并把连续空白压缩为一个空格
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 缓存键使用的规整形式：额外转为小写
pub fn normalize_for_key(text: &str) -> String {
    collapse_whitespace(text).to_lowercase()
}

// ============================================================================
// 翻译缓存
// ============================================================================

/// 翻译缓存
pub struct TranslationCache {
    store: Arc<dyn CacheStore>,
    memory: Mutex<LruCache<String, CacheEntry>>,
    expiry_ms: i64,
    stats: AtomicCacheStats,
}

impl TranslationCache {
    pub fn new(store: Arc<dyn CacheStore>, config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.memory_capacity).unwrap_or(NonZeroUsize::MIN);

        Self {
            store,
            memory: Mutex::new(LruCache::new(capacity)),
            expiry_ms: config.expiry.as_millis().min(i64::MAX as u128) as i64,
            stats: AtomicCacheStats::default(),
        }
    }

    /// 纯内存缓存
    pub fn in_memory(config: CacheConfig) -> Self {
        Self::new(Arc::new(MemoryStore::new()), config)
    }

    /// 按配置创建；未启用缓存时返回 None，有路径时使用 redb
    pub fn from_config(config: &TranslationConfig) -> TranslationResult<Option<Arc<Self>>> {
        if !config.cache_enabled {
            return Ok(None);
        }

        let store: Arc<dyn CacheStore> = match &config.cache_path {
            Some(path) => Arc::new(RedbStore::open(shellexpand::tilde(path).as_ref())?),
            None => Arc::new(MemoryStore::new()),
        };

        Ok(Some(Arc::new(Self::new(store, CacheConfig::from(config)))))
    }

    /// 计算缓存键
    pub fn cache_key(text: &str, target_lang: &str) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(target_lang.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(normalize_for_key(text).as_bytes());
        let hex = hasher.finalize().to_hex();
        format!("{}{}", constants::CACHE_KEY_PREFIX, &hex.as_str()[..32])
    }

    fn memory(&self) -> MutexGuard<'_, LruCache<String, CacheEntry>> {
        self.memory.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_expired(&self, entry: &CacheEntry, now_ms: i64) -> bool {
        now_ms.saturating_sub(entry.stored_at) > self.expiry_ms
    }

    /// 查找译文；过期、原文不一致或存储错误都视为未命中
    pub fn get(&self, text: &str, target_lang: &str) -> Option<String> {
        let key = Self::cache_key(text, target_lang);
        let original = collapse_whitespace(text);
        let now_ms = Utc::now().timestamp_millis();

        let cached = self.memory().get(&key).cloned();
        let entry = match cached {
            Some(entry) => Some(entry),
            None => match self.store.get(&key) {
                Ok(entry) => entry,
                Err(e) => {
                    self.stats.store_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("读取缓存失败，按未命中处理: {}", e);
                    None
                }
            },
        };

        let hit = entry.filter(|entry| {
            !self.is_expired(entry, now_ms) && (entry.original.is_empty() || entry.original == original)
        });

        match hit {
            Some(entry) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                let translation = entry.translation.clone();
                self.memory().put(key, entry);
                Some(translation)
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                self.memory().pop(&key);
                None
            }
        }
    }

    /// 写入译文；存储失败只记录警告
    pub fn set(&self, text: &str, target_lang: &str, translation: &str) {
        self.set_at(text, target_lang, translation, Utc::now().timestamp_millis());
    }

    /// 以指定时间戳写入
    pub fn set_at(&self, text: &str, target_lang: &str, translation: &str, stored_at: i64) {
        let key = Self::cache_key(text, target_lang);
        let entry = CacheEntry {
            translation: translation.to_string(),
            stored_at,
            original: collapse_whitespace(text),
        };

        if let Err(e) = self.store.set(&key, &entry) {
            self.stats.store_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("写入缓存失败: {}", e);
        }
        self.memory().put(key, entry);
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// 清理过期条目，返回删除数量
    pub fn purge_expired(&self) -> usize {
        let now_ms = Utc::now().timestamp_millis();

        let expired_in_memory: Vec<String> = self
            .memory()
            .iter()
            .filter(|(_, entry)| self.is_expired(entry, now_ms))
            .map(|(key, _)| key.clone())
            .collect();
        {
            let mut memory = self.memory();
            for key in &expired_in_memory {
                memory.pop(key);
            }
        }

        let keys = match self.store.list_keys_with_prefix(constants::CACHE_KEY_PREFIX) {
            Ok(keys) => keys,
            Err(e) => {
                self.stats.store_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("列出缓存键失败: {}", e);
                return 0;
            }
        };

        let mut purged = 0;
        for key in keys {
            let expired = match self.store.get(&key) {
                Ok(Some(entry)) => self.is_expired(&entry, now_ms),
                Ok(None) => false,
                Err(e) => {
                    self.stats.store_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("缓存条目不可读，删除: {} ({})", key, e);
                    true
                }
            };

            if expired {
                match self.store.remove(&key) {
                    Ok(()) => purged += 1,
                    Err(e) => {
                        self.stats.store_errors.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!("删除过期缓存失败: {}", e);
                    }
                }
            }
        }

        self.stats.purged.fetch_add(purged as u64, Ordering::Relaxed);
        if purged > 0 {
            tracing::info!("已清理 {} 条过期翻译缓存", purged);
        }
        purged
    }

    /// 只清空内存层
    pub fn clear_memory(&self) {
        self.memory().clear();
    }

    pub fn memory_len(&self) -> usize {
        self.memory().len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            writes: self.stats.writes.load(Ordering::Relaxed),
            purged: self.stats.purged.load(Ordering::Relaxed),
            store_errors: self.stats.store_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translation::error::TranslationError;

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    struct BrokenStore;

    impl CacheStore for BrokenStore {
        fn get(&self, _key: &str) -> TranslationResult<Option<CacheEntry>> {
            Err(TranslationError::CacheError("disk gone".into()))
        }
        fn set(&self, _key: &str, _value: &CacheEntry) -> TranslationResult<()> {
            Err(TranslationError::CacheError("disk gone".into()))
        }
        fn remove(&self, _key: &str) -> TranslationResult<()> {
            Err(TranslationError::CacheError("disk gone".into()))
        }
        fn list_keys_with_prefix(&self, _prefix: &str) -> TranslationResult<Vec<String>> {
            Err(TranslationError::CacheError("disk gone".into()))
        }
    }

    #[test]
    fn test_key_is_deterministic_and_normalized() {
        let a = TranslationCache::cache_key("  Hello   World ", "ko");
        let b = TranslationCache::cache_key("hello world", "ko");
        let c = TranslationCache::cache_key("hello world", "ja");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("tc:"));
        assert_eq!(a.len(), 3 + 32);
    }

    #[test]
    fn test_set_then_get() {
        let cache = TranslationCache::in_memory(CacheConfig::default());
        assert_eq!(cache.get("Hello", "ko"), None);

        cache.set("Hello", "ko", "안녕하세요");
        assert_eq!(cache.get("Hello", "ko").as_deref(), Some("안녕하세요"));
        assert_eq!(cache.get("  Hello ", "ko").as_deref(), Some("안녕하세요"));
        assert_eq!(cache.get("Hello", "ja"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.writes, 1);
    }

    #[test]
    fn test_case_only_difference_is_a_miss() {
        let cache = TranslationCache::in_memory(CacheConfig::default());
        cache.set("US", "ko", "미국");

        // 键相同，但原文确认失败
        assert_eq!(cache.get("us", "ko"), None);
    }

    #[test]
    fn test_expired_entries_are_absent_and_purged() {
        let store = Arc::new(MemoryStore::new());
        let cache = TranslationCache::new(store.clone(), CacheConfig::default());
        let now = Utc::now().timestamp_millis();

        cache.set_at("Old", "ko", "오래된", now - 8 * DAY_MS);
        cache.set_at("Fresh", "ko", "새로운", now - DAY_MS);

        assert_eq!(cache.get("Old", "ko"), None);
        assert_eq!(cache.get("Fresh", "ko").as_deref(), Some("새로운"));

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(cache.purge_expired(), 0, "purge is idempotent");
        assert_eq!(cache.stats().purged, 1);
    }

    #[test]
    fn test_store_errors_degrade_to_miss() {
        let cache = TranslationCache::new(Arc::new(BrokenStore), CacheConfig::default());
        cache.clear_memory();

        assert_eq!(cache.get("Hello", "ko"), None);
        cache.set("Hello", "ko", "안녕");
        assert_eq!(cache.purge_expired(), 0);
        assert!(cache.stats().store_errors >= 3);
    }

    #[test]
    fn test_memory_layer_is_bounded() {
        let config = CacheConfig {
            memory_capacity: 2,
            ..Default::default()
        };
        let cache = TranslationCache::in_memory(config);
        cache.set("one", "ko", "1");
        cache.set("two", "ko", "2");
        cache.set("three", "ko", "3");

        assert_eq!(cache.memory_len(), 2);
        assert_eq!(cache.get("one", "ko").as_deref(), Some("1"), "store still has evicted entries");
    }

    #[test]
    fn test_from_config_respects_flags() {
        let mut config = TranslationConfig::default();
        config.cache_enabled = false;
        assert!(TranslationCache::from_config(&config).unwrap().is_none());

        let dir = tempfile::tempdir().unwrap();
        config.cache_enabled = true;
        config.cache_path = Some(dir.path().join("c.redb").to_string_lossy().into_owned());
        let cache = TranslationCache::from_config(&config).unwrap().unwrap();
        cache.set("Hello", "ko", "안녕");
        assert_eq!(cache.get("Hello", "ko").as_deref(), Some("안녕"));
    }
}
