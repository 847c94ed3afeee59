//! 翻译模块
//!
//! 按职责划分：
//! - **config**: 配置加载与校验
//! - **core**: 客户端、回写器、可见性调度器和页面翻译器
//! - **pipeline**: 位置寻址、单元状态、文本提取和批次引擎
//! - **storage**: 翻译缓存及存储后端
//! - **events**: 流水线事件
//! - **error**: 统一错误类型
//!
//! # 基本用法
//!
//! ```rust,no_run
//! use pagelingo::translation::{translate_html, HttpTranslationClient, TranslationConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TranslationConfig::default_with_lang("ko", None);
//! let client = HttpTranslationClient::from_config(&config)?;
//! let html = translate_html("<p>Hello</p>", &config, client).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod storage;

pub use config::{ConfigManager, TranslationConfig};
pub use self::core::{
    translate_html, ClientProcessor, HttpTranslationClient, PageTranslator, Reconciler,
    SchedulerSignal, TranslationClient, VisibilityScheduler,
};
pub use error::{TranslationError, TranslationResult};
pub use events::{EventSink, PipelineEvent};
pub use pipeline::{
    AbortHandle, BatchConfig, BatchEngine, ItemProcessor, PositionDescriptor, RunStatus,
    RunSummary, TextUnit,
};
pub use storage::TranslationCache;
