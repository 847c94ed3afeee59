//! 配置管理器
//!
//! 提供统一的配置接口，优先级：环境变量 > 配置文件 > 默认值

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::constants;
use crate::translation::error::{TranslationError, TranslationResult};

/// 翻译流水线配置
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TranslationConfig {
    // 基础配置
    pub target_lang: String,
    pub api_url: String,

    // 批次配置
    pub batch_size: usize,
    pub max_concurrent_batches: usize,
    pub retry_count: usize,
    pub retry_delay_ms: u64,
    pub timeout_ms: u64,
    pub progress_interval_ms: u64,

    // 提取配置
    pub min_text_length: usize,
    pub exclude_selectors: Vec<String>,
    pub translatable_attrs: Vec<String>,
    pub yield_every: usize,

    // 缓存配置
    pub cache_enabled: bool,
    pub cache_expiry_days: u64,
    pub cache_capacity: usize,
    pub cache_path: Option<String>,

    // 可见性调度
    pub root_margin: f64,
    pub translate_full_page: bool,
    pub immediate_translation: bool,

    // 写回配置
    pub safe_mode: bool,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            target_lang: constants::DEFAULT_TARGET_LANG.to_string(),
            api_url: constants::DEFAULT_API_URL.to_string(),

            batch_size: constants::DEFAULT_BATCH_SIZE,
            max_concurrent_batches: constants::DEFAULT_MAX_CONCURRENT_BATCHES,
            retry_count: constants::DEFAULT_RETRY_COUNT,
            retry_delay_ms: constants::DEFAULT_RETRY_DELAY_MS,
            timeout_ms: constants::DEFAULT_TIMEOUT_MS,
            progress_interval_ms: constants::DEFAULT_PROGRESS_INTERVAL_MS,

            min_text_length: constants::MIN_TEXT_LENGTH,
            exclude_selectors: Vec::new(),
            translatable_attrs: constants::TRANSLATABLE_ATTRS
                .iter()
                .map(|attr| attr.to_string())
                .collect(),
            yield_every: constants::DEFAULT_YIELD_EVERY,

            cache_enabled: true,
            cache_expiry_days: constants::DEFAULT_CACHE_EXPIRY_DAYS,
            cache_capacity: constants::DEFAULT_CACHE_CAPACITY,
            cache_path: None,

            root_margin: constants::DEFAULT_ROOT_MARGIN,
            translate_full_page: false,
            immediate_translation: false,

            safe_mode: true,
        }
    }
}

impl TranslationConfig {
    /// 创建带指定语言的默认配置
    pub fn default_with_lang(target_lang: &str, api_url: Option<&str>) -> Self {
        let mut config = Self {
            target_lang: target_lang.to_string(),
            ..Self::default()
        };
        if let Some(url) = api_url {
            config.api_url = url.to_string();
        }
        config
    }

    /// 验证配置
    pub fn validate(&self) -> TranslationResult<()> {
        if self.target_lang.trim().is_empty() {
            return Err(TranslationError::ConfigError("目标语言不能为空".to_string()));
        }

        if self.batch_size == 0 {
            return Err(TranslationError::ConfigError("批次大小不能为0".to_string()));
        }

        if self.max_concurrent_batches == 0 {
            return Err(TranslationError::ConfigError("最大并发批次数不能为0".to_string()));
        }

        if self.timeout_ms == 0 {
            return Err(TranslationError::ConfigError("超时时间必须大于0".to_string()));
        }

        if self.min_text_length == 0 {
            return Err(TranslationError::ConfigError("最小文本长度不能为0".to_string()));
        }

        if self.yield_every == 0 {
            return Err(TranslationError::ConfigError("让出间隔不能为0".to_string()));
        }

        if !self.root_margin.is_finite() || self.root_margin < 0.0 {
            return Err(TranslationError::ConfigError(format!(
                "rootMargin 必须为非负数: {}",
                self.root_margin
            )));
        }

        if self.cache_enabled && self.cache_capacity == 0 {
            return Err(TranslationError::ConfigError("启用缓存时缓存容量不能为0".to_string()));
        }

        if self.cache_enabled && self.cache_expiry_days == 0 {
            return Err(TranslationError::ConfigError("缓存过期天数不能为0".to_string()));
        }

        Ok(())
    }

    /// 应用环境变量覆盖，只处理显式设置的变量
    pub fn apply_env_overrides(&mut self) -> TranslationResult<()> {
        use crate::env::{cache, translation, EnvVar};

        fn read<V: EnvVar<T>, T>() -> TranslationResult<Option<T>> {
            if !V::is_set() {
                return Ok(None);
            }
            V::get()
                .map(Some)
                .map_err(|e| TranslationError::ConfigError(e.to_string()))
        }

        if let Some(target_lang) = read::<translation::TargetLang, _>()? {
            self.target_lang = target_lang;
        }
        if let Some(api_url) = read::<translation::ApiUrl, _>()? {
            tracing::info!("环境变量覆盖 API URL: {}", api_url);
            self.api_url = api_url;
        }
        if let Some(batch_size) = read::<translation::BatchSize, _>()? {
            self.batch_size = batch_size;
        }
        if let Some(max) = read::<translation::MaxConcurrentBatches, _>()? {
            self.max_concurrent_batches = max;
        }
        if let Some(retry_count) = read::<translation::RetryCount, _>()? {
            self.retry_count = retry_count;
        }
        if let Some(delay) = read::<translation::RetryDelay, _>()? {
            self.retry_delay_ms = delay.as_millis() as u64;
        }
        if let Some(timeout) = read::<translation::Timeout, _>()? {
            self.timeout_ms = timeout.as_millis() as u64;
        }
        if let Some(min_len) = read::<translation::MinTextLength, _>()? {
            self.min_text_length = min_len;
        }
        if let Some(enabled) = read::<cache::Enabled, _>()? {
            self.cache_enabled = enabled;
        }
        if let Some(days) = read::<cache::ExpiryDays, _>()? {
            self.cache_expiry_days = days;
        }
        if let Some(path) = read::<cache::Path, _>()? {
            self.cache_path = Some(path);
        }

        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn cache_expiry(&self) -> Duration {
        Duration::from_secs(self.cache_expiry_days.saturating_mul(24 * 60 * 60))
    }
}

/// 配置管理器
pub struct ConfigManager {
    config: TranslationConfig,
}

impl ConfigManager {
    /// 从默认搜索路径和环境变量创建
    pub fn new() -> TranslationResult<Self> {
        Self::load_dotenv();
        let config = Self::load_config()?;
        Self::finish(config)
    }

    /// 从指定文件创建
    pub fn from_path(path: &str) -> TranslationResult<Self> {
        Self::load_dotenv();
        let expanded = shellexpand::tilde(path);
        let config = Self::load_from_file(&expanded)?;
        Self::finish(config)
    }

    /// 从内存中的 TOML 文本创建，不读取环境变量
    pub fn from_toml_str(content: &str) -> TranslationResult<Self> {
        let config: TranslationConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(Self { config })
    }

    fn finish(mut config: TranslationConfig) -> TranslationResult<Self> {
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(Self { config })
    }

    /// 获取配置
    pub fn get_config(&self) -> &TranslationConfig {
        &self.config
    }

    pub fn into_config(self) -> TranslationConfig {
        self.config
    }

    /// 以当前配置为基础，替换目标语言和 API 地址
    pub fn create_simple_config(&self, target_lang: &str, api_url: Option<&str>) -> TranslationConfig {
        let mut config = self.config.clone();
        config.target_lang = target_lang.to_string();
        if let Some(url) = api_url {
            config.api_url = url.to_string();
        }
        config
    }

    fn load_config() -> TranslationResult<TranslationConfig> {
        for path in constants::CONFIG_PATHS {
            let expanded_path = shellexpand::tilde(path);
            if Path::new(expanded_path.as_ref()).exists() {
                tracing::info!("加载配置文件: {}", expanded_path);
                return Self::load_from_file(&expanded_path);
            }
        }

        tracing::info!("未找到配置文件，使用默认配置");
        Ok(TranslationConfig::default())
    }

    fn load_from_file(path: &str) -> TranslationResult<TranslationConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TranslationError::ConfigError(format!("读取配置文件失败 {}: {}", path, e)))?;

        if path.ends_with(".json") {
            serde_json::from_str(&content)
                .map_err(|e| TranslationError::ConfigError(format!("解析JSON配置失败: {}", e)))
        } else {
            toml::from_str(&content)
                .map_err(|e| TranslationError::ConfigError(format!("解析TOML配置失败: {}", e)))
        }
    }

    fn load_dotenv() {
        let env_files = [".env.local", ".env"];

        for env_file in &env_files {
            if Path::new(env_file).exists() && dotenv::from_filename(env_file).is_ok() {
                tracing::info!("已加载环境变量文件: {}", env_file);
                break;
            }
        }
    }

    /// 生成示例配置文件
    pub fn generate_example_config(path: &str) -> TranslationResult<()> {
        let content = toml::to_string_pretty(&TranslationConfig::default())
            .map_err(|e| TranslationError::ConfigError(format!("序列化配置失败: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| TranslationError::ConfigError(format!("写入配置文件失败: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TranslationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 40);
        assert_eq!(config.max_concurrent_batches, 3);
        assert_eq!(config.retry_count, 2);
        assert_eq!(config.timeout(), Duration::from_secs(20));
        assert_eq!(config.cache_expiry(), Duration::from_secs(7 * 86_400));
        assert!(config.safe_mode);
    }

    #[test]
    fn test_huge_expiry_saturates() {
        let mut config = TranslationConfig::default();
        config.cache_expiry_days = u64::MAX;
        assert_eq!(config.cache_expiry(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = TranslationConfig::default();
        config.batch_size = 0;
        assert!(matches!(config.validate(), Err(TranslationError::ConfigError(_))));

        let mut config = TranslationConfig::default();
        config.max_concurrent_batches = 0;
        assert!(config.validate().is_err());

        let mut config = TranslationConfig::default();
        config.root_margin = -1.0;
        assert!(config.validate().is_err());

        let mut config = TranslationConfig::default();
        config.target_lang = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let manager = ConfigManager::from_toml_str(
            r#"
            target_lang = "ko"
            batch_size = 2
            exclude_selectors = [".sidebar", "nav"]
            "#,
        )
        .unwrap();

        let config = manager.get_config();
        assert_eq!(config.target_lang, "ko");
        assert_eq!(config.batch_size, 2);
        assert_eq!(config.exclude_selectors.len(), 2);
        assert_eq!(config.max_concurrent_batches, 3, "unset fields keep defaults");
    }

    #[test]
    fn test_toml_with_invalid_value_fails() {
        let result = ConfigManager::from_toml_str("max_concurrent_batches = 0");
        assert!(result.is_err());
    }

    #[test]
    fn test_example_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pagelingo.toml");
        let path = path.to_str().unwrap();

        ConfigManager::generate_example_config(path).unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        let config: TranslationConfig = toml::from_str(&content).unwrap();
        assert_eq!(config, TranslationConfig::default());
    }

    #[test]
    fn test_simple_config_overrides_language() {
        let manager = ConfigManager::from_toml_str("").unwrap();
        let config = manager.create_simple_config("ja", Some("https://api.example.com"));
        assert_eq!(config.target_lang, "ja");
        assert_eq!(config.api_url, "https://api.example.com");
    }
}
