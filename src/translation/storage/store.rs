//! 缓存后端
//!
//! `TranslationCache` 只依赖四个操作：get / set / remove / list_keys_with_prefix。
//! 提供内存实现（dashmap）和磁盘实现（redb）。

use std::path::Path;

use dashmap::DashMap;
use redb::{Database, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::translation::error::TranslationResult;

const TRANSLATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("translations");

/// 持久化的缓存值
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub translation: String,
    /// unix 毫秒
    pub stored_at: i64,
    /// 空白规整后的原文，用于碰撞确认
    #[serde(default)]
    pub original: String,
}

/// 缓存存储接口
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> TranslationResult<Option<CacheEntry>>;
    fn set(&self, key: &str, value: &CacheEntry) -> TranslationResult<()>;
    fn remove(&self, key: &str) -> TranslationResult<()>;
    fn list_keys_with_prefix(&self, prefix: &str) -> TranslationResult<Vec<String>>;
}

/// 内存存储
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, key: &str) -> TranslationResult<Option<CacheEntry>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    fn set(&self, key: &str, value: &CacheEntry) -> TranslationResult<()> {
        self.entries.insert(key.to_string(), value.clone());
        Ok(())
    }

    fn remove(&self, key: &str) -> TranslationResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn list_keys_with_prefix(&self, prefix: &str) -> TranslationResult<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect())
    }
}

/// redb 磁盘存储
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// 打开或创建数据库文件
    pub fn open(path: impl AsRef<Path>) -> TranslationResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Database::create(path)?;

        // 确保表存在，之后的只读事务才能打开它
        let txn = db.begin_write()?;
        {
            txn.open_table(TRANSLATIONS)?;
        }
        txn.commit()?;

        tracing::info!("已打开翻译缓存数据库: {}", path.display());
        Ok(Self { db })
    }
}

impl CacheStore for RedbStore {
    fn get(&self, key: &str) -> TranslationResult<Option<CacheEntry>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(TRANSLATIONS)?;
        match table.get(key)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &CacheEntry) -> TranslationResult<()> {
        let bytes = serde_json::to_vec(value)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(TRANSLATIONS)?;
            table.insert(key, bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn remove(&self, key: &str) -> TranslationResult<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(TRANSLATIONS)?;
            table.remove(key)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn list_keys_with_prefix(&self, prefix: &str) -> TranslationResult<Vec<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(TRANSLATIONS)?;

        let mut keys = Vec::new();
        for item in table.range::<&str>(prefix..)? {
            let (key, _) = item?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key.to_string());
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(translation: &str, stored_at: i64) -> CacheEntry {
        CacheEntry {
            translation: translation.to_string(),
            stored_at,
            original: "hello".to_string(),
        }
    }

    fn exercise(store: &dyn CacheStore) {
        store.set("tc:a", &entry("A", 1)).unwrap();
        store.set("tc:b", &entry("B", 2)).unwrap();
        store.set("other:c", &entry("C", 3)).unwrap();

        assert_eq!(store.get("tc:a").unwrap(), Some(entry("A", 1)));
        assert_eq!(store.get("tc:missing").unwrap(), None);

        let mut keys = store.list_keys_with_prefix("tc:").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["tc:a".to_string(), "tc:b".to_string()]);

        store.remove("tc:a").unwrap();
        store.remove("tc:never-existed").unwrap();
        assert_eq!(store.get("tc:a").unwrap(), None);
        assert_eq!(store.list_keys_with_prefix("tc:").unwrap().len(), 1);
    }

    #[test]
    fn test_memory_store_contract() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn test_redb_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("cache.redb")).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_redb_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.redb");

        {
            let store = RedbStore::open(&path).unwrap();
            store.set("tc:k", &entry("persisted", 42)).unwrap();
        }

        let store = RedbStore::open(&path).unwrap();
        assert_eq!(store.get("tc:k").unwrap(), Some(entry("persisted", 42)));
    }

    #[test]
    fn test_entry_without_original_still_decodes() {
        let decoded: CacheEntry =
            serde_json::from_str(r#"{"translation":"안녕","storedAt":1700000000000}"#).unwrap();
        assert_eq!(decoded.translation, "안녕");
        assert!(decoded.original.is_empty());
    }
}
