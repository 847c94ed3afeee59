//! 存储模块
//!
//! 翻译缓存及其可替换的存储后端。

pub mod cache;
pub mod store;

pub use cache::{collapse_whitespace, normalize_for_key, CacheConfig, CacheStats, TranslationCache};
pub use store::{CacheEntry, CacheStore, MemoryStore, RedbStore};
