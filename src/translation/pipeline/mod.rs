//! 翻译管道模块
//!
//! 提供文本处理管道：位置寻址、单元状态、过滤、提取和批次调度

pub mod addressing;
pub mod batch;
pub mod collector;
pub mod filters;
pub mod state;

// 重新导出主要类型
pub use addressing::{Addresser, Location, LocationRef, PositionDescriptor, Resolution, UnitKind};
pub use batch::{
    backoff_delay, AbortHandle, BatchConfig, BatchEngine, FnProcessor, ItemProcessor, RunOptions,
    RunOutput, RunStatus, RunSummary,
};
pub use collector::{CollectorConfig, ExtractionStats, TextCollector, TextUnit};
pub use filters::{ExclusionRules, FilterReason, Selector, TextFilter};
pub use state::{RegistryCounts, UnitRegistry, UnitState};
