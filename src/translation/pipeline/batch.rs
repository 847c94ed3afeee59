//! 批次调度引擎
//!
//! 本模块是翻译流水线的并发核心：去重、分批、有界并发执行、逐项重试，
//! 最后把结果按原始下标投影回输入数组。
//!
//! ## 处理流程
//!
//! 1. **去重**: 以空白规整后的文本为键，保留首次出现的顺序
//! 2. **分批**: 按 `batch_size` 切分唯一项
//! 3. **有界并发**: 同时运行的批次数不超过 `max_concurrent_batches`
//! 4. **缓存检查**: 命中缓存的项不会交给处理器
//! 5. **重试**: 失败项按 `retry_delay * 2^(attempt-1)` 退避重试
//! 6. **回填**: 一个翻译结果服务于所有重复项
//!
//! 所有批次在同一个任务上以 `buffer_unordered` 推进，不会派生新任务，
//! 因而处理器可以持有 `Rc`/`RefCell` 等非 `Send` 状态。
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! let engine = BatchEngine::new(BatchConfig::default(), "ko")?;
//! let output = engine.run(&items, &processor, RunOptions::default()).await?;
//! assert_eq!(output.results.len(), items.len());
//! ```

use std::cell::Cell;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::future::{self, FutureExt, LocalBoxFuture};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::translation::config::{constants, TranslationConfig};
use crate::translation::error::{TranslationError, TranslationResult};
use crate::translation::events::{EventSink, PipelineEvent};
use crate::translation::storage::{collapse_whitespace, TranslationCache};

// ============================================================================
// 配置
// ============================================================================

/// 批次引擎配置
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// 每批最多包含的唯一文本数
    pub batch_size: usize,
    /// 同时运行的批次上限
    pub max_concurrent_batches: usize,
    /// 首次尝试之后的重试次数
    pub retry_count: usize,
    /// 退避基数
    pub retry_delay: Duration,
    /// 单次处理器调用的超时
    pub timeout: Duration,
    /// 进度事件的最小间隔
    pub progress_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: constants::DEFAULT_BATCH_SIZE,
            max_concurrent_batches: constants::DEFAULT_MAX_CONCURRENT_BATCHES,
            retry_count: constants::DEFAULT_RETRY_COUNT,
            retry_delay: Duration::from_millis(constants::DEFAULT_RETRY_DELAY_MS),
            timeout: Duration::from_millis(constants::DEFAULT_TIMEOUT_MS),
            progress_interval: Duration::from_millis(constants::DEFAULT_PROGRESS_INTERVAL_MS),
        }
    }
}

impl From<&TranslationConfig> for BatchConfig {
    fn from(config: &TranslationConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            max_concurrent_batches: config.max_concurrent_batches,
            retry_count: config.retry_count,
            retry_delay: config.retry_delay(),
            timeout: config.timeout(),
            progress_interval: config.progress_interval(),
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> TranslationResult<()> {
        if self.batch_size == 0 {
            return Err(TranslationError::ConfigError("批次大小必须大于0".to_string()));
        }
        if self.max_concurrent_batches == 0 {
            return Err(TranslationError::ConfigError("并发批次数必须大于0".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(TranslationError::ConfigError("超时时间必须大于0".to_string()));
        }
        Ok(())
    }
}

/// 第 `attempt` 次重试（从1开始）之前的等待时间
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent)
}

// ============================================================================
// 处理器
// ============================================================================

/// 把一段文本变成译文的处理器
///
/// 每个批次的首次尝试调用 `process_batch`，重试时对失败项单独调用 `process`。
pub trait ItemProcessor {
    fn process<'a>(&'a self, text: &'a str) -> LocalBoxFuture<'a, TranslationResult<String>>;

    /// 批量处理，外层错误表示整个批次失败；默认逐项并发调用 `process`
    fn process_batch<'a>(
        &'a self,
        texts: &'a [String],
    ) -> LocalBoxFuture<'a, TranslationResult<Vec<TranslationResult<String>>>> {
        async move { Ok(future::join_all(texts.iter().map(|text| self.process(text))).await) }
            .boxed_local()
    }
}

/// 把闭包包装成处理器
pub struct FnProcessor<F> {
    f: F,
}

impl<F> FnProcessor<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F, Fut> ItemProcessor for FnProcessor<F>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = TranslationResult<String>> + 'static,
{
    fn process<'a>(&'a self, text: &'a str) -> LocalBoxFuture<'a, TranslationResult<String>> {
        (self.f)(text.to_string()).boxed_local()
    }
}

// ============================================================================
// 取消
// ============================================================================

/// 外部取消句柄
///
/// 取消只阻止新批次启动，在途批次会正常结束。取消后根令牌被替换，
/// 之后的运行不受影响。
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    root: Arc<Mutex<CancellationToken>>,
}

impl AbortHandle {
    fn lock(&self) -> MutexGuard<'_, CancellationToken> {
        self.root.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn abort(&self) {
        let mut root = self.lock();
        root.cancel();
        *root = CancellationToken::new();
    }

    fn child_token(&self) -> CancellationToken {
        self.lock().child_token()
    }
}

// ============================================================================
// 运行结果
// ============================================================================

/// 单次运行选项
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// 批次级异常是否升级为整次运行失败
    pub abort_on_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Aborted,
}

/// 运行摘要
///
/// `skipped_count` 包含空白项以及因取消而未被调度的项。
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub total: usize,
    pub unique: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub cache_hits: usize,
    pub batches: usize,
    pub completed_batches: usize,
    pub elapsed_ms: u64,
    pub items_per_second: f64,
}

/// 运行输出，`results` 与输入逐项对齐
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub results: Vec<Option<String>>,
    pub summary: RunSummary,
    pub status: RunStatus,
}

impl RunOutput {
    pub fn is_aborted(&self) -> bool {
        self.status == RunStatus::Aborted
    }
}

/// 引擎累计统计
#[derive(Debug, Default)]
pub struct EngineStats {
    runs: AtomicUsize,
    batches: AtomicUsize,
    items: AtomicUsize,
    failures: AtomicUsize,
    cache_hits: AtomicUsize,
    processing_time: AtomicU64,
}

impl EngineStats {
    fn record(&self, summary: &RunSummary) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        self.batches.fetch_add(summary.completed_batches, Ordering::Relaxed);
        self.items.fetch_add(summary.total, Ordering::Relaxed);
        self.failures.fetch_add(summary.failed_count, Ordering::Relaxed);
        self.cache_hits.fetch_add(summary.cache_hits, Ordering::Relaxed);
        self.processing_time
            .fetch_add(summary.elapsed_ms, Ordering::Relaxed);
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::Relaxed)
    }

    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::Relaxed)
    }

    pub fn items(&self) -> usize {
        self.items.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> usize {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// 累计耗时（毫秒）
    pub fn processing_time_ms(&self) -> u64 {
        self.processing_time.load(Ordering::Relaxed)
    }
}

// ============================================================================
// 引擎
// ============================================================================

struct BatchJob {
    index: usize,
    /// 在唯一项数组中的起始偏移
    offset: usize,
    items: Vec<String>,
}

struct JobContext<'a> {
    token: &'a CancellationToken,
    active: &'a Cell<usize>,
    abort_on_error: bool,
}

struct JobOutcome {
    index: usize,
    offset: usize,
    results: Vec<Option<String>>,
    cache_hits: usize,
    elapsed: Duration,
    escalated: Option<TranslationError>,
}

/// 批次调度引擎
pub struct BatchEngine {
    config: BatchConfig,
    target_lang: String,
    cache: Option<Arc<TranslationCache>>,
    events: EventSink,
    abort: AbortHandle,
    stats: EngineStats,
}

impl BatchEngine {
    /// 配置无效时直接拒绝
    pub fn new(config: BatchConfig, target_lang: &str) -> TranslationResult<Self> {
        config.validate()?;
        if target_lang.trim().is_empty() {
            return Err(TranslationError::ConfigError("目标语言不能为空".to_string()));
        }

        Ok(Self {
            config,
            target_lang: target_lang.to_string(),
            cache: None,
            events: EventSink::disabled(),
            abort: AbortHandle::default(),
            stats: EngineStats::default(),
        })
    }

    pub fn with_cache(mut self, cache: Arc<TranslationCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn target_lang(&self) -> &str {
        &self.target_lang
    }

    pub fn cache(&self) -> Option<&Arc<TranslationCache>> {
        self.cache.as_ref()
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// 停止调度新的批次
    pub fn abort(&self) {
        tracing::info!("收到取消请求，停止调度新批次");
        self.abort.abort();
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// 执行一次翻译运行
    ///
    /// 单项失败不会让运行失败，只有 `abort_on_error` 会把批次异常升级为错误返回。
    pub async fn run<P>(
        &self,
        items: &[String],
        processor: &P,
        options: RunOptions,
    ) -> TranslationResult<RunOutput>
    where
        P: ItemProcessor + ?Sized,
    {
        let started = Instant::now();
        let token = self.abort.child_token();

        // 去重：规整文本 -> 唯一项下标
        let mut slots: Vec<Option<usize>> = Vec::with_capacity(items.len());
        let mut seen: HashMap<String, usize> = HashMap::new();
        let mut unique: Vec<String> = Vec::new();
        for item in items {
            let key = collapse_whitespace(item);
            if key.is_empty() {
                slots.push(None);
                continue;
            }
            let next = unique.len();
            let slot = *seen.entry(key).or_insert_with(|| {
                unique.push(item.clone());
                next
            });
            slots.push(Some(slot));
        }

        let jobs: Vec<BatchJob> = unique
            .chunks(self.config.batch_size)
            .enumerate()
            .map(|(index, chunk)| BatchJob {
                index,
                offset: index * self.config.batch_size,
                items: chunk.to_vec(),
            })
            .collect();
        let batch_count = jobs.len();

        tracing::info!(
            "开始翻译运行: {} 项, {} 个唯一项, {} 个批次",
            items.len(),
            unique.len(),
            batch_count
        );
        self.events.emit(PipelineEvent::TranslationStart {
            total: items.len(),
            batches: batch_count,
        });

        let active = Cell::new(0usize);
        let ctx = JobContext {
            token: &token,
            active: &active,
            abort_on_error: options.abort_on_error,
        };

        let mut unique_results: Vec<Option<String>> = vec![None; unique.len()];
        let mut scheduled = vec![false; unique.len()];
        let mut processed = 0usize;
        let mut completed_batches = 0usize;
        let mut cache_hits = 0usize;
        let mut escalated: Option<TranslationError> = None;
        let mut last_progress: Option<Instant> = None;

        {
            let gate = &token;
            let ctx = &ctx;
            let mut outcomes = stream::iter(jobs)
                .take_while(move |_| future::ready(!gate.is_cancelled()))
                .map(|job| self.process_job(processor, job, ctx))
                .buffer_unordered(self.config.max_concurrent_batches);

            while let Some(outcome) = outcomes.next().await {
                completed_batches += 1;
                processed += outcome.results.len();
                cache_hits += outcome.cache_hits;

                for (position, value) in outcome.results.into_iter().enumerate() {
                    scheduled[outcome.offset + position] = true;
                    unique_results[outcome.offset + position] = value;
                }

                if let Some(error) = outcome.escalated {
                    tracing::error!("批次 {} 失败，终止运行: {}", outcome.index, error);
                    escalated.get_or_insert(error);
                }

                tracing::debug!(
                    "批次 {} 完成，用时 {:?} ({}/{})",
                    outcome.index,
                    outcome.elapsed,
                    completed_batches,
                    batch_count
                );
                self.events.emit(PipelineEvent::BatchComplete {
                    batch_index: outcome.index,
                    elapsed_ms: outcome.elapsed.as_millis() as u64,
                    completed: completed_batches,
                    total: batch_count,
                });

                let due = last_progress
                    .map_or(true, |at| at.elapsed() >= self.config.progress_interval);
                if due {
                    last_progress = Some(Instant::now());
                    self.emit_progress(processed, unique.len(), active.get(), started);
                }
            }
        }
        self.emit_progress(processed, unique.len(), 0, started);

        // 回填到原始下标
        let results: Vec<Option<String>> = slots
            .iter()
            .map(|slot| slot.and_then(|index| unique_results[index].clone()))
            .collect();

        let success_count = results.iter().filter(|r| r.is_some()).count();
        let skipped_count = slots
            .iter()
            .filter(|slot| slot.map_or(true, |index| !scheduled[index]))
            .count();
        let failed_count = items.len() - success_count - skipped_count;

        let elapsed = started.elapsed();
        let summary = RunSummary {
            total: items.len(),
            unique: unique.len(),
            success_count,
            failed_count,
            skipped_count,
            cache_hits,
            batches: batch_count,
            completed_batches,
            elapsed_ms: elapsed.as_millis() as u64,
            items_per_second: if elapsed.as_secs_f64() > 0.0 {
                success_count as f64 / elapsed.as_secs_f64()
            } else {
                success_count as f64
            },
        };
        self.stats.record(&summary);

        if let Some(error) = escalated {
            self.events.emit(PipelineEvent::TranslationError {
                error: error.to_string(),
            });
            return Err(TranslationError::BatchProcessingError(error.to_string()));
        }

        let status = if completed_batches < batch_count {
            tracing::warn!(
                "翻译运行已取消: 完成 {}/{} 个批次",
                completed_batches,
                batch_count
            );
            self.events.emit(PipelineEvent::TranslationAborted {
                summary: summary.clone(),
            });
            RunStatus::Aborted
        } else {
            tracing::info!(
                "翻译运行完成: 成功 {}, 失败 {}, 缓存命中 {}, 用时 {}ms",
                summary.success_count,
                summary.failed_count,
                summary.cache_hits,
                summary.elapsed_ms
            );
            self.events.emit(PipelineEvent::TranslationComplete {
                summary: summary.clone(),
            });
            RunStatus::Completed
        };

        Ok(RunOutput {
            results,
            summary,
            status,
        })
    }

    fn emit_progress(&self, processed: usize, total: usize, active: usize, started: Instant) {
        let percentage = if total == 0 {
            100.0
        } else {
            processed as f64 * 100.0 / total as f64
        };
        self.events.emit(PipelineEvent::Progress {
            processed,
            total,
            percentage,
            active_batches: active,
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
    }

    async fn process_job<P>(&self, processor: &P, job: BatchJob, ctx: &JobContext<'_>) -> JobOutcome
    where
        P: ItemProcessor + ?Sized,
    {
        ctx.active.set(ctx.active.get() + 1);
        let started = Instant::now();
        let mut results: Vec<Option<String>> = vec![None; job.items.len()];
        let mut misses: Vec<usize> = Vec::new();
        let mut cache_hits = 0;
        let mut escalated = None;

        for (position, text) in job.items.iter().enumerate() {
            let hit = self
                .cache
                .as_ref()
                .and_then(|cache| cache.get(text, &self.target_lang));
            match hit {
                Some(translation) => {
                    results[position] = Some(translation);
                    cache_hits += 1;
                }
                None => misses.push(position),
            }
        }

        if !misses.is_empty() {
            let texts: Vec<String> = misses.iter().map(|&p| job.items[p].clone()).collect();

            let first = match timeout(self.config.timeout, processor.process_batch(&texts)).await {
                Ok(result) => result,
                Err(_) => Err(TranslationError::TimeoutError(format!(
                    "批次 {} 超过 {:?}",
                    job.index, self.config.timeout
                ))),
            };

            let attempts: Option<Vec<TranslationResult<String>>> = match first {
                Ok(mut per_item) => {
                    if per_item.len() != texts.len() {
                        tracing::warn!(
                            "批次 {} 结果数量不匹配: 期望 {}, 实际 {}",
                            job.index,
                            texts.len(),
                            per_item.len()
                        );
                        per_item.resize_with(texts.len(), || {
                            Err(TranslationError::BatchProcessingError(
                                "处理器返回的结果数量不足".to_string(),
                            ))
                        });
                    }
                    Some(per_item)
                }
                Err(error) if ctx.abort_on_error => {
                    ctx.token.cancel();
                    escalated = Some(error);
                    None
                }
                Err(error) => {
                    tracing::warn!("批次 {} 整体失败，转为逐项重试: {}", job.index, error);
                    Some(texts.iter().map(|_| Err(error.clone())).collect())
                }
            };

            if let Some(attempts) = attempts {
                let resolved = future::join_all(attempts.into_iter().zip(texts.iter()).map(
                    |(attempt, text)| async move {
                        match attempt {
                            Ok(translation) => Some(translation),
                            Err(error) => self.retry_item(processor, text, error).await,
                        }
                    },
                ))
                .await;

                for (&position, value) in misses.iter().zip(resolved) {
                    if let (Some(cache), Some(translation)) = (&self.cache, &value) {
                        cache.set(&job.items[position], &self.target_lang, translation);
                    }
                    results[position] = value;
                }
            }
        }

        ctx.active.set(ctx.active.get().saturating_sub(1));
        JobOutcome {
            index: job.index,
            offset: job.offset,
            results,
            cache_hits,
            elapsed: started.elapsed(),
            escalated,
        }
    }

    /// 显式循环重试；重试耗尽返回 None
    async fn retry_item<P>(&self, processor: &P, text: &str, mut last_error: TranslationError) -> Option<String>
    where
        P: ItemProcessor + ?Sized,
    {
        for attempt in 1..=self.config.retry_count {
            if !last_error.is_retryable() {
                break;
            }
            sleep(backoff_delay(self.config.retry_delay, attempt as u32)).await;

            match timeout(self.config.timeout, processor.process(text)).await {
                Ok(Ok(translation)) => return Some(translation),
                Ok(Err(error)) => last_error = error,
                Err(_) => {
                    last_error = TranslationError::TimeoutError(format!(
                        "单项处理超过 {:?}",
                        self.config.timeout
                    ))
                }
            }
            tracing::debug!("第 {} 次重试失败: {}", attempt, last_error);
        }

        tracing::debug!("放弃翻译 {:?}: {}", truncate_for_log(text), last_error);
        None
    }
}

fn truncate_for_log(text: &str) -> String {
    text.chars().take(40).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// 记录每次调用，并可让指定文本先失败若干次
    #[derive(Default)]
    struct Recording {
        calls: RefCell<Vec<String>>,
        failures: RefCell<HashMap<String, usize>>,
        error: Option<TranslationError>,
    }

    impl Recording {
        fn failing(text: &str, times: usize) -> Self {
            let recording = Self::default();
            recording.failures.borrow_mut().insert(text.to_string(), times);
            recording
        }

        fn calls_for(&self, text: &str) -> usize {
            self.calls.borrow().iter().filter(|c| *c == text).count()
        }
    }

    impl ItemProcessor for Recording {
        fn process<'a>(&'a self, text: &'a str) -> LocalBoxFuture<'a, TranslationResult<String>> {
            async move {
                self.calls.borrow_mut().push(text.to_string());
                if let Some(left) = self.failures.borrow_mut().get_mut(text) {
                    if *left > 0 {
                        *left -= 1;
                        return Err(self
                            .error
                            .clone()
                            .unwrap_or_else(|| TranslationError::NetworkError("flaky".to_string())));
                    }
                }
                Ok(format!("<{}>", text))
            }
            .boxed_local()
        }
    }

    /// 记录同时在途的批次数
    #[derive(Default)]
    struct ConcurrencyProbe {
        current: Cell<usize>,
        peak: Cell<usize>,
        batch_calls: Cell<usize>,
    }

    impl ItemProcessor for ConcurrencyProbe {
        fn process<'a>(&'a self, text: &'a str) -> LocalBoxFuture<'a, TranslationResult<String>> {
            async move { Ok(text.to_uppercase()) }.boxed_local()
        }

        fn process_batch<'a>(
            &'a self,
            texts: &'a [String],
        ) -> LocalBoxFuture<'a, TranslationResult<Vec<TranslationResult<String>>>> {
            async move {
                self.batch_calls.set(self.batch_calls.get() + 1);
                self.current.set(self.current.get() + 1);
                self.peak.set(self.peak.get().max(self.current.get()));
                sleep(Duration::from_millis(50)).await;
                self.current.set(self.current.get() - 1);
                Ok(texts.iter().map(|t| Ok(t.to_uppercase())).collect())
            }
            .boxed_local()
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn config(batch_size: usize) -> BatchConfig {
        BatchConfig {
            batch_size,
            retry_delay: Duration::from_millis(10),
            ..BatchConfig::default()
        }
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let base = Duration::from_millis(1000);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(2000));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(4000));
    }

    #[test]
    fn test_invalid_config_rejected_before_work() {
        assert!(matches!(
            BatchEngine::new(config(0), "ko"),
            Err(TranslationError::ConfigError(_))
        ));
        let zero_concurrency = BatchConfig {
            max_concurrent_batches: 0,
            ..BatchConfig::default()
        };
        assert!(BatchEngine::new(zero_concurrency, "ko").is_err());
        assert!(BatchEngine::new(BatchConfig::default(), " ").is_err());
    }

    #[tokio::test]
    async fn test_duplicates_share_one_translation() {
        let engine = BatchEngine::new(config(2), "ko").unwrap();
        let processor = Recording::default();
        let items = strings(&["Hello", "World", "Hello"]);

        let output = engine
            .run(&items, &processor, RunOptions::default())
            .await
            .unwrap();

        assert_eq!(
            output.results,
            vec![
                Some("<Hello>".to_string()),
                Some("<World>".to_string()),
                Some("<Hello>".to_string())
            ]
        );
        assert_eq!(processor.calls.borrow().len(), 2);
        assert_eq!(output.summary.unique, 2);
        assert_eq!(output.summary.batches, 1);
        assert_eq!(output.summary.success_count, 3);
        assert_eq!(output.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_blank_items_are_skipped() {
        let engine = BatchEngine::new(config(4), "ko").unwrap();
        let processor = Recording::default();
        let items = strings(&["  ", "a  b", "a b"]);

        let output = engine
            .run(&items, &processor, RunOptions::default())
            .await
            .unwrap();

        assert_eq!(output.results[0], None);
        assert_eq!(output.results[1], output.results[2]);
        assert_eq!(output.summary.skipped_count, 1);
        assert_eq!(output.summary.failed_count, 0);
        assert_eq!(processor.calls.borrow().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_on_third_invocation() {
        let engine = BatchEngine::new(config(10), "ko").unwrap();
        let processor = Recording::failing("flaky", 2);
        let items = strings(&["flaky", "steady"]);

        let output = engine
            .run(&items, &processor, RunOptions::default())
            .await
            .unwrap();

        assert_eq!(output.results[0].as_deref(), Some("<flaky>"));
        assert_eq!(processor.calls_for("flaky"), 3);
        assert_eq!(processor.calls_for("steady"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_yield_none() {
        let engine = BatchEngine::new(config(10), "ko").unwrap();
        let processor = Recording::failing("doomed", 10);
        let items = strings(&["doomed", "fine"]);

        let output = engine
            .run(&items, &processor, RunOptions::default())
            .await
            .unwrap();

        assert_eq!(output.results[0], None);
        assert!(output.results[1].is_some());
        assert_eq!(processor.calls_for("doomed"), 3);
        assert_eq!(output.summary.failed_count, 1);
        assert_eq!(output.status, RunStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_is_not_retried() {
        let engine = BatchEngine::new(config(10), "ko").unwrap();
        let mut processor = Recording::failing("bad", 5);
        processor.error = Some(TranslationError::InvalidInput("nope".to_string()));
        let items = strings(&["bad"]);

        let output = engine
            .run(&items, &processor, RunOptions::default())
            .await
            .unwrap();

        assert_eq!(output.results, vec![None]);
        assert_eq!(processor.calls_for("bad"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_never_exceeds_bound() {
        let engine = BatchEngine::new(config(1), "ko").unwrap();
        let probe = ConcurrencyProbe::default();
        let items: Vec<String> = (0..10).map(|i| format!("item {}", i)).collect();

        let output = engine
            .run(&items, &probe, RunOptions::default())
            .await
            .unwrap();

        assert_eq!(probe.batch_calls.get(), 10);
        assert!(probe.peak.get() <= 3, "peak was {}", probe.peak.get());
        assert_eq!(probe.peak.get(), 3);
        assert_eq!(output.summary.completed_batches, 10);
        assert_eq!(output.results[7].as_deref(), Some("ITEM 7"));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_processor() {
        let cache = Arc::new(TranslationCache::in_memory(Default::default()));
        let engine = BatchEngine::new(config(10), "ko").unwrap().with_cache(cache.clone());
        let items = strings(&["Hello"]);

        let first = Recording::default();
        engine.run(&items, &first, RunOptions::default()).await.unwrap();
        assert_eq!(first.calls.borrow().len(), 1);

        let second = Recording::default();
        let output = engine.run(&items, &second, RunOptions::default()).await.unwrap();
        assert_eq!(second.calls.borrow().len(), 0);
        assert_eq!(output.results[0].as_deref(), Some("<Hello>"));
        assert_eq!(output.summary.cache_hits, 1);
        assert_eq!(engine.stats().runs(), 2);
    }

    struct AbortingProcessor {
        handle: AbortHandle,
    }

    impl ItemProcessor for AbortingProcessor {
        fn process<'a>(&'a self, text: &'a str) -> LocalBoxFuture<'a, TranslationResult<String>> {
            async move {
                self.handle.abort();
                Ok(text.to_string())
            }
            .boxed_local()
        }
    }

    #[tokio::test]
    async fn test_abort_stops_new_batches_and_keeps_finished_results() {
        let engine = BatchEngine::new(
            BatchConfig {
                max_concurrent_batches: 1,
                ..config(1)
            },
            "ko",
        )
        .unwrap();
        let (events, mut rx) = EventSink::channel();
        let engine = engine.with_events(events);
        let processor = AbortingProcessor {
            handle: engine.abort_handle(),
        };
        let items = strings(&["one", "two", "three"]);

        let output = engine
            .run(&items, &processor, RunOptions::default())
            .await
            .unwrap();

        assert_eq!(output.status, RunStatus::Aborted);
        assert_eq!(output.results[0].as_deref(), Some("one"));
        assert_eq!(output.results[1], None);
        assert_eq!(output.summary.skipped_count, 2);

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        assert_eq!(names.last(), Some(&"translation-aborted"));

        // 取消后的新运行不受影响
        let output = engine
            .run(&strings(&["again"]), &Recording::default(), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(output.status, RunStatus::Completed);
    }

    struct BrokenBatches;

    impl ItemProcessor for BrokenBatches {
        fn process<'a>(&'a self, text: &'a str) -> LocalBoxFuture<'a, TranslationResult<String>> {
            async move { Ok(text.to_string()) }.boxed_local()
        }

        fn process_batch<'a>(
            &'a self,
            _texts: &'a [String],
        ) -> LocalBoxFuture<'a, TranslationResult<Vec<TranslationResult<String>>>> {
            async move { Err(TranslationError::TranslationServiceError("down".to_string())) }
                .boxed_local()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_failure_falls_back_to_item_retries() {
        let engine = BatchEngine::new(config(10), "ko").unwrap();
        let output = engine
            .run(&strings(&["a1", "b2"]), &BrokenBatches, RunOptions::default())
            .await
            .unwrap();
        assert_eq!(output.results, vec![Some("a1".to_string()), Some("b2".to_string())]);
    }

    #[tokio::test]
    async fn test_abort_on_error_escalates() {
        let (events, mut rx) = EventSink::channel();
        let engine = BatchEngine::new(config(10), "ko").unwrap().with_events(events);

        let result = engine
            .run(
                &strings(&["a1"]),
                &BrokenBatches,
                RunOptions {
                    abort_on_error: true,
                },
            )
            .await;

        assert!(matches!(result, Err(TranslationError::BatchProcessingError(_))));
        let mut saw_error = false;
        while let Ok(event) = rx.try_recv() {
            saw_error |= matches!(event, PipelineEvent::TranslationError { .. });
        }
        assert!(saw_error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure_and_is_retried() {
        let attempts = std::rc::Rc::new(Cell::new(0));
        let counter = attempts.clone();
        let processor = FnProcessor::new(move |text: String| {
            let counter = counter.clone();
            async move {
                counter.set(counter.get() + 1);
                if counter.get() == 1 {
                    sleep(Duration::from_secs(60)).await;
                }
                Ok(text)
            }
        });
        let engine = BatchEngine::new(
            BatchConfig {
                timeout: Duration::from_secs(1),
                ..config(10)
            },
            "ko",
        )
        .unwrap();

        let output = engine
            .run(&strings(&["slow"]), &processor, RunOptions::default())
            .await
            .unwrap();

        assert_eq!(output.results[0].as_deref(), Some("slow"));
        assert_eq!(attempts.get(), 2);
    }

    #[tokio::test]
    async fn test_empty_run_completes() {
        let engine = BatchEngine::new(BatchConfig::default(), "ko").unwrap();
        let output = engine
            .run(&[], &Recording::default(), RunOptions::default())
            .await
            .unwrap();
        assert!(output.results.is_empty());
        assert_eq!(output.status, RunStatus::Completed);
    }
}
