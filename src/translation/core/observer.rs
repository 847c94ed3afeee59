//! 可见性调度器
//!
//! 每个被观察的区域经历 `unwatched → pending-visibility → visible` 或被移除。
//! 可见性信号和插入信号都会触发对相应子树的提取，再交给批次引擎。
//! 所有工作都在同一个任务上推进：`select!` 同时等待新信号和在途批次，
//! 批次在途时仍能接收后续信号。

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{FutureExt, LocalBoxFuture};
use futures::stream::{FuturesUnordered, StreamExt};
use markup5ever_rcdom::{Handle, Node, NodeData};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::reconciler::{ApplyReport, Reconciler, TranslationItem};
use crate::parsers::html::dom::{get_node_attr, get_parent_node, is_content_text};
use crate::translation::config::{constants, TranslationConfig};
use crate::translation::error::helpers::log_error;
use crate::translation::error::TranslationResult;
use crate::translation::events::{EventSink, PipelineEvent};
use crate::translation::pipeline::batch::{BatchEngine, ItemProcessor, RunOptions, RunOutput, RunStatus, RunSummary};
use crate::translation::pipeline::collector::{CollectorConfig, TextCollector, TextUnit};
use crate::translation::pipeline::state::UnitRegistry;
use crate::translation::storage::TranslationCache;

// ============================================================================
// 布局
// ============================================================================

/// 视口，单位与宿主布局一致（通常为像素）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub top: f64,
    pub height: f64,
}

/// 元素的纵向范围
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub top: f64,
    pub bottom: f64,
}

impl Viewport {
    /// 按 `margin` 向上下扩展后是否与元素相交
    pub fn intersects(&self, bounds: &Bounds, margin: f64) -> bool {
        bounds.bottom >= self.top - margin && bounds.top <= self.top + self.height + margin
    }
}

/// 宿主提供的布局查询
pub trait LayoutProbe {
    /// 元素未布局（例如已隐藏）时返回 None
    fn bounds(&self, element: &Handle) -> Option<Bounds>;
}

// ============================================================================
// 信号与状态
// ============================================================================

/// 宿主发给调度器的信号
#[derive(Debug)]
pub enum SchedulerSignal {
    /// 这些区域进入了扩展后的视口
    Visible(Vec<Handle>),
    /// 视口移动，由 `LayoutProbe` 判断哪些区域可见
    Scrolled(Viewport),
    /// 新插入的子树
    Inserted(Vec<Handle>),
    /// 已移除的子树
    Removed(Vec<Handle>),
    /// 忽略可见性，立即翻译整页
    TranslateAll,
    /// 恢复原文并重新开始观察
    Reset,
    /// 等待在途批次结束后退出
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegionState {
    Unwatched,
    PendingVisibility,
    Visible,
}

struct Region {
    node: Weak<Node>,
    state: RegionState,
}

/// 一次同步翻译的结果
#[derive(Debug, Clone, Default)]
pub struct PassReport {
    pub units: usize,
    pub summary: Option<RunSummary>,
    pub status: Option<RunStatus>,
    pub apply: ApplyReport,
}

/// 调度器运行统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerReport {
    pub signals: usize,
    pub extractions: usize,
    pub units_submitted: usize,
    pub runs_completed: usize,
    pub runs_failed: usize,
    pub stale_discarded: usize,
    pub cache_purged: usize,
    pub apply: ApplyReport,
}

struct JobOutcome {
    generation: u64,
    units: Vec<TextUnit>,
    result: TranslationResult<RunOutput>,
}

enum LoopEvent {
    Signal(SchedulerSignal),
    Closed,
    Finished(JobOutcome),
    Idle,
}

// ============================================================================
// 调度器
// ============================================================================

/// 可见性调度器
pub struct VisibilityScheduler<P: ItemProcessor + 'static> {
    document: Handle,
    engine: Rc<BatchEngine>,
    processor: Rc<P>,
    reconciler: Rc<Reconciler>,
    registry: Rc<RefCell<UnitRegistry>>,
    collector: TextCollector,
    regions: HashMap<usize, Region>,
    translatable_attrs: Vec<String>,
    probe: Option<Box<dyn LayoutProbe>>,
    viewport: Option<Viewport>,
    root_margin: f64,
    immediate_translation: bool,
    translate_full_page: bool,
    events: EventSink,
    cache: Option<Arc<TranslationCache>>,
    generation: u64,
    in_flight: FuturesUnordered<LocalBoxFuture<'static, JobOutcome>>,
    report: SchedulerReport,
}

impl<P: ItemProcessor + 'static> VisibilityScheduler<P> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        document: Handle,
        config: &TranslationConfig,
        engine: Rc<BatchEngine>,
        processor: Rc<P>,
        registry: Rc<RefCell<UnitRegistry>>,
        reconciler: Rc<Reconciler>,
        events: EventSink,
    ) -> Self {
        let collector = TextCollector::new(
            CollectorConfig::from(config),
            document.clone(),
            registry.clone(),
        );
        let cache = engine.cache().cloned();

        Self {
            document,
            engine,
            processor,
            reconciler,
            registry,
            collector,
            regions: HashMap::new(),
            translatable_attrs: config.translatable_attrs.clone(),
            probe: None,
            viewport: None,
            root_margin: config.root_margin,
            immediate_translation: config.immediate_translation,
            translate_full_page: config.translate_full_page,
            events,
            cache,
            generation: 0,
            in_flight: FuturesUnordered::new(),
            report: SchedulerReport::default(),
        }
    }

    pub fn with_probe(mut self, probe: Box<dyn LayoutProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn report(&self) -> &SchedulerReport {
        &self.report
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn region_state(&self, node: &Handle) -> RegionState {
        self.regions
            .get(&node_key(node))
            .filter(|region| region.node.strong_count() > 0)
            .map(|region| region.state)
            .unwrap_or(RegionState::Unwatched)
    }

    /// 登记 `root` 子树中的文本容器，返回新登记的数量
    pub fn observe(&mut self, root: &Handle) -> usize {
        let mut added = 0;
        let mut stack = vec![root.clone()];

        while let Some(node) = stack.pop() {
            if !matches!(node.data, NodeData::Element { .. } | NodeData::Document) {
                continue;
            }
            if matches!(node.data, NodeData::Element { .. }) && self.collector.rules().excludes(&node) {
                continue;
            }

            if self.is_text_container(&node) {
                let key = node_key(&node);
                let fresh = self
                    .regions
                    .get(&key)
                    .map_or(true, |region| region.node.strong_count() == 0);
                if fresh {
                    self.regions.insert(
                        key,
                        Region {
                            node: Rc::downgrade(&node),
                            state: RegionState::PendingVisibility,
                        },
                    );
                    added += 1;
                }
            }

            for child in node.children.borrow().iter().rev() {
                stack.push(child.clone());
            }
        }

        tracing::debug!("新登记 {} 个区域，共 {} 个", added, self.regions.len());
        added
    }

    /// 主循环：处理信号直到 `Shutdown` 或通道关闭，并等待在途批次完成
    pub async fn run(
        &mut self,
        mut signals: mpsc::Receiver<SchedulerSignal>,
    ) -> TranslationResult<SchedulerReport> {
        if self.translate_full_page {
            self.handle(SchedulerSignal::TranslateAll).await;
        }

        let period = Duration::from_secs(constants::CACHE_PURGE_INTERVAL_SECS);
        let mut purge = interval_at(Instant::now() + period, period);
        purge.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut open = true;

        loop {
            if !open && self.in_flight.is_empty() {
                break;
            }

            let event = tokio::select! {
                signal = signals.recv(), if open => match signal {
                    Some(signal) => LoopEvent::Signal(signal),
                    None => LoopEvent::Closed,
                },
                Some(outcome) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    LoopEvent::Finished(outcome)
                }
                _ = purge.tick(), if open && self.in_flight.is_empty() => LoopEvent::Idle,
            };

            match event {
                LoopEvent::Signal(SchedulerSignal::Shutdown) => {
                    self.report.signals += 1;
                    tracing::info!("调度器收到关闭信号，等待 {} 个在途任务", self.in_flight.len());
                    open = false;
                }
                LoopEvent::Signal(signal) => {
                    self.report.signals += 1;
                    self.handle(signal).await;
                }
                LoopEvent::Closed => open = false,
                LoopEvent::Finished(outcome) => self.complete(outcome),
                LoopEvent::Idle => self.purge_cache(),
            }
        }

        Ok(self.report.clone())
    }

    /// 立即翻译 `root` 子树并等待结果写回
    pub async fn translate_now(&mut self, root: &Handle) -> TranslationResult<PassReport> {
        self.observe(root);
        self.mark_visible_within(root);

        let units = self.collector.extract_yielding(root).await;
        self.report.extractions += 1;
        if units.is_empty() {
            return Ok(PassReport::default());
        }

        let texts: Vec<String> = units.iter().map(|unit| unit.text.clone()).collect();
        self.report.units_submitted += units.len();

        let output = match self
            .engine
            .run(&texts, self.processor.as_ref(), RunOptions::default())
            .await
        {
            Ok(output) => output,
            Err(error) => {
                self.report.runs_failed += 1;
                self.reconciler.release_units(&units);
                return Err(error);
            }
        };

        self.report.runs_completed += 1;
        if output.is_aborted() {
            tracing::info!("翻译已取消，仅写回已完成的批次");
        }
        let apply = self.apply_output(&units, &output);
        Ok(PassReport {
            units: units.len(),
            summary: Some(output.summary),
            status: Some(output.status),
            apply,
        })
    }

    async fn handle(&mut self, signal: SchedulerSignal) {
        match signal {
            SchedulerSignal::Visible(nodes) => {
                for node in nodes {
                    self.reveal(&node).await;
                }
            }
            SchedulerSignal::Scrolled(viewport) => {
                self.viewport = Some(viewport);
                for node in self.visible_regions(viewport) {
                    self.reveal(&node).await;
                }
            }
            SchedulerSignal::Inserted(nodes) => {
                for node in nodes {
                    self.observe(&node);
                    if self.immediate_translation {
                        self.mark_visible_within(&node);
                        self.submit_subtree(&node, true).await;
                    }
                }
                if !self.immediate_translation {
                    if let Some(viewport) = self.viewport {
                        for node in self.visible_regions(viewport) {
                            self.reveal(&node).await;
                        }
                    }
                }
            }
            SchedulerSignal::Removed(nodes) => {
                for node in nodes {
                    self.regions.retain(|_, region| match region.node.upgrade() {
                        Some(region_node) => !is_within(&region_node, &node),
                        None => false,
                    });
                }
                let pruned = self.registry.borrow_mut().prune();
                tracing::debug!("移除后剩余 {} 个区域，清理 {} 个单元", self.regions.len(), pruned);
            }
            SchedulerSignal::TranslateAll => {
                let document = self.document.clone();
                self.observe(&document);
                self.mark_visible_within(&document);
                self.submit_subtree(&document, false).await;
            }
            SchedulerSignal::Reset => self.reset(),
            SchedulerSignal::Shutdown => {}
        }
    }

    /// 区域变为可见并提交其文本
    async fn reveal(&mut self, node: &Handle) {
        if self.region_state(node) == RegionState::Unwatched {
            self.observe(node);
        }
        if self.region_state(node) == RegionState::Visible {
            return;
        }
        self.mark_visible_within(node);

        let units = self.collector.extract_yielding(node).await;
        self.report.extractions += 1;
        if !units.is_empty() {
            self.events.emit(PipelineEvent::UnitsVisible {
                units: units.clone(),
            });
        }
        self.submit(units);
    }

    async fn submit_subtree(&mut self, root: &Handle, inserted: bool) {
        let units = self.collector.extract_yielding(root).await;
        self.report.extractions += 1;
        if inserted && !units.is_empty() {
            self.events.emit(PipelineEvent::UnitsAdded {
                units: units.clone(),
            });
        }
        self.submit(units);
    }

    fn submit(&mut self, units: Vec<TextUnit>) {
        if units.is_empty() {
            return;
        }

        self.report.units_submitted += units.len();
        let engine = self.engine.clone();
        let processor = self.processor.clone();
        let generation = self.generation;

        self.in_flight.push(
            async move {
                let texts: Vec<String> = units.iter().map(|unit| unit.text.clone()).collect();
                let result = engine
                    .run(&texts, processor.as_ref(), RunOptions::default())
                    .await;
                JobOutcome {
                    generation,
                    units,
                    result,
                }
            }
            .boxed_local(),
        );
    }

    fn complete(&mut self, outcome: JobOutcome) {
        if outcome.generation != self.generation {
            // 重置之前提交的任务：结果作废，单元交还
            self.report.stale_discarded += 1;
            self.reconciler.release_units(&outcome.units);
            return;
        }

        match outcome.result {
            Ok(output) => {
                self.report.runs_completed += 1;
                self.apply_output(&outcome.units, &output);
            }
            Err(error) => {
                self.report.runs_failed += 1;
                let units = outcome.units.len();
                log_error(&error.with_context(format!("{} 个单元交还", units)));
                self.reconciler.release_units(&outcome.units);
            }
        }
    }

    fn apply_output(&mut self, units: &[TextUnit], output: &RunOutput) -> ApplyReport {
        let items: Vec<TranslationItem> = units
            .iter()
            .zip(output.results.iter())
            .map(|(unit, translated)| TranslationItem::from_unit(unit, translated.clone()))
            .collect();
        let apply = self.reconciler.apply(&items);
        self.report.apply.merge(apply);
        apply
    }

    fn reset(&mut self) {
        self.engine.abort();
        self.generation += 1;
        let restored = self.reconciler.reset(None);
        for region in self.regions.values_mut() {
            region.state = RegionState::PendingVisibility;
        }
        tracing::info!("调度器已重置，恢复 {} 个单元", restored);
    }

    fn purge_cache(&mut self) {
        if let Some(cache) = &self.cache {
            let purged = cache.purge_expired();
            self.report.cache_purged += purged;
        }
        self.registry.borrow_mut().prune();
    }

    fn visible_regions(&self, viewport: Viewport) -> Vec<Handle> {
        let Some(probe) = &self.probe else {
            tracing::warn!("未设置布局探针，忽略滚动信号");
            return Vec::new();
        };

        self.regions
            .values()
            .filter(|region| region.state == RegionState::PendingVisibility)
            .filter_map(|region| region.node.upgrade())
            .filter(|node| {
                probe
                    .bounds(node)
                    .is_some_and(|bounds| viewport.intersects(&bounds, self.root_margin))
            })
            .collect()
    }

    fn mark_visible_within(&mut self, root: &Handle) {
        for region in self.regions.values_mut() {
            if let Some(node) = region.node.upgrade() {
                if is_within(&node, root) {
                    region.state = RegionState::Visible;
                }
            }
        }
    }

    fn is_text_container(&self, node: &Handle) -> bool {
        if !matches!(node.data, NodeData::Element { .. }) {
            return false;
        }
        let has_text = node.children.borrow().iter().any(is_content_text);
        has_text
            || self.translatable_attrs.iter().any(|attr| {
                get_node_attr(node, attr).is_some_and(|value| !value.trim().is_empty())
            })
    }
}

fn node_key(node: &Handle) -> usize {
    Rc::as_ptr(node) as usize
}

/// `node` 是否为 `ancestor` 本身或其后代
fn is_within(node: &Handle, ancestor: &Handle) -> bool {
    let mut current = node.clone();
    loop {
        if Rc::ptr_eq(&current, ancestor) {
            return true;
        }
        match get_parent_node(&current) {
            Some(parent) => current = parent,
            None => return false,
        }
    }
}
