//! 翻译配置管理模块
//!
//! 支持环境变量、配置文件和默认值，加载后统一校验

pub mod manager;

pub use manager::{ConfigManager, TranslationConfig};

/// 配置常量
pub mod constants {
    // 批次处理相关
    pub const DEFAULT_BATCH_SIZE: usize = 40;
    pub const DEFAULT_MAX_CONCURRENT_BATCHES: usize = 3;
    pub const DEFAULT_RETRY_COUNT: usize = 2;
    pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
    pub const DEFAULT_TIMEOUT_MS: u64 = 20_000;
    pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 100;

    // 文本过滤相关
    pub const MIN_TEXT_LENGTH: usize = 2;
    pub const DEFAULT_YIELD_EVERY: usize = 500;
    pub const MAX_WALK_DEPTH: usize = 512;

    // 可见性调度
    pub const DEFAULT_ROOT_MARGIN: f64 = 200.0;

    // 默认API设置
    pub const DEFAULT_API_URL: &str = "http://localhost:1188/translate";
    pub const DEFAULT_TARGET_LANG: &str = "zh";

    // 缓存设置
    pub const DEFAULT_CACHE_EXPIRY_DAYS: u64 = 7;
    pub const DEFAULT_CACHE_CAPACITY: usize = 2000;
    pub const CACHE_KEY_PREFIX: &str = "tc:";
    pub const CACHE_PURGE_INTERVAL_SECS: u64 = 600;

    // 可翻译属性
    pub const TRANSLATABLE_ATTRS: &[&str] = &[
        "title", "alt", "placeholder", "aria-label", "aria-description", "label",
    ];

    // 跳过的元素
    pub const SKIP_ELEMENTS: &[&str] = &[
        "script", "style", "code", "pre", "noscript", "template", "textarea", "meta", "link",
        "head", "svg", "math", "canvas", "video", "audio", "embed", "object", "iframe", "kbd",
        "samp", "var",
    ];

    // 配置文件搜索路径
    pub const CONFIG_PATHS: &[&str] = &[
        "pagelingo.toml",
        ".pagelingo.toml",
        "~/.config/pagelingo/config.toml",
        "/etc/pagelingo/config.toml",
    ];
}
