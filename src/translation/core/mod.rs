//! 翻译系统核心模块
//!
//! 提取得到的文本单元经批次引擎翻译后由回写器写回内容树；
//! 可见性调度器决定何时提取哪一部分。
//!
//! ## 模块依赖关系
//!
//! ```text
//! PageTranslator (service.rs)
//!     └── VisibilityScheduler (observer.rs)
//!             ├── TextCollector (pipeline/collector.rs)
//!             ├── BatchEngine (pipeline/batch.rs)
//!             │       └── ItemProcessor ← ClientProcessor (client.rs)
//!             └── Reconciler (reconciler.rs)
//! ```

pub mod client;
pub mod observer;
pub mod reconciler;
pub mod service;

pub use client::{align_results, ClientProcessor, HttpTranslationClient, TranslationClient};
pub use observer::{
    Bounds, LayoutProbe, PassReport, RegionState, SchedulerReport, SchedulerSignal, Viewport,
    VisibilityScheduler,
};
pub use reconciler::{ApplyReport, Reconciler, TranslationItem};
pub use service::{translate_html, PageTranslator};
