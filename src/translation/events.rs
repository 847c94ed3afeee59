//! 对外事件
//!
//! 流水线只通过这些事件与宿主（界面、消息层）耦合。事件经由显式传入的
//! `EventSink` 发出，接收端关闭后发送被静默忽略。

use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::translation::pipeline::batch::RunSummary;
use crate::translation::pipeline::collector::TextUnit;

/// 流水线事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum PipelineEvent {
    TranslationStart {
        total: usize,
        batches: usize,
    },
    BatchComplete {
        batch_index: usize,
        elapsed_ms: u64,
        completed: usize,
        total: usize,
    },
    Progress {
        processed: usize,
        total: usize,
        percentage: f64,
        active_batches: usize,
        elapsed_ms: u64,
    },
    TranslationComplete {
        summary: RunSummary,
    },
    TranslationAborted {
        summary: RunSummary,
    },
    TranslationError {
        error: String,
    },
    UnitsVisible {
        units: Vec<TextUnit>,
    },
    UnitsAdded {
        units: Vec<TextUnit>,
    },
}

impl PipelineEvent {
    /// 事件的标签名，与序列化后的 `type` 字段一致
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::TranslationStart { .. } => "translation-start",
            PipelineEvent::BatchComplete { .. } => "batch-complete",
            PipelineEvent::Progress { .. } => "progress",
            PipelineEvent::TranslationComplete { .. } => "translation-complete",
            PipelineEvent::TranslationAborted { .. } => "translation-aborted",
            PipelineEvent::TranslationError { .. } => "translation-error",
            PipelineEvent::UnitsVisible { .. } => "units-visible",
            PipelineEvent::UnitsAdded { .. } => "units-added",
        }
    }
}

/// 事件发送端
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<UnboundedSender<PipelineEvent>>,
}

impl EventSink {
    pub fn new(tx: UnboundedSender<PipelineEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// 创建发送端和对应的接收端
    pub fn channel() -> (Self, UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// 不发送任何事件
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    pub fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                tracing::trace!("事件接收端已关闭，丢弃事件");
            }
        }
    }
}
