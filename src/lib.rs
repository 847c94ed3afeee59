//! # Pagelingo
//!
//! 增量式、保持结构的网页翻译库：从 HTML 内容树中提取可翻译文本，
//! 按批次调用翻译服务，再把译文写回原位置，且随时可以恢复原文。
//!
//! ## 模块组织
//!
//! - `env` - 类型化环境变量
//! - `parsers` - HTML 解析、DOM 操作与序列化
//! - `translation` - 翻译流水线

pub mod env;
pub mod parsers;
pub mod translation;

pub use translation::{
    translate_html, PageTranslator, TranslationConfig, TranslationError, TranslationResult,
};
