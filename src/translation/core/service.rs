//! 页面翻译服务
//!
//! `PageTranslator` 通过显式构造组装提取器、批次引擎、回写器和可见性调度器，
//! 组件之间不共享任何全局状态。
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! let dom = html_to_dom(html.as_bytes(), "utf-8");
//! let processor = ClientProcessor::new(client, &config.target_lang);
//! let mut translator =
//!     PageTranslator::new(dom.document.clone(), &config, None, processor, EventSink::disabled())?;
//! let pass = translator.translate_page().await?;
//! println!("写回 {} 个单元", pass.apply.applied);
//! ```

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use markup5ever_rcdom::Handle;

use super::client::{ClientProcessor, TranslationClient};
use super::observer::{PassReport, VisibilityScheduler};
use super::reconciler::Reconciler;
use crate::parsers::html::dom::html_to_dom;
use crate::parsers::html::serializer::serialize_document;
use crate::translation::config::TranslationConfig;
use crate::translation::error::{TranslationError, TranslationResult};
use crate::translation::events::EventSink;
use crate::translation::pipeline::addressing::PositionDescriptor;
use crate::translation::pipeline::batch::{AbortHandle, BatchConfig, BatchEngine, ItemProcessor};
use crate::translation::pipeline::state::{RegistryCounts, UnitRegistry};
use crate::translation::storage::TranslationCache;

/// 页面翻译器
pub struct PageTranslator<P: ItemProcessor + 'static> {
    document: Handle,
    config: TranslationConfig,
    engine: Rc<BatchEngine>,
    registry: Rc<RefCell<UnitRegistry>>,
    reconciler: Rc<Reconciler>,
    scheduler: VisibilityScheduler<P>,
}

impl<P: ItemProcessor + 'static> PageTranslator<P> {
    /// 配置无效时在任何工作开始前返回错误
    pub fn new(
        document: Handle,
        config: &TranslationConfig,
        cache: Option<Arc<TranslationCache>>,
        processor: P,
        events: EventSink,
    ) -> TranslationResult<Self> {
        config.validate()?;

        let mut engine = BatchEngine::new(BatchConfig::from(config), &config.target_lang)?
            .with_events(events.clone());
        if let Some(cache) = cache {
            engine = engine.with_cache(cache);
        }
        let engine = Rc::new(engine);

        let registry = Rc::new(RefCell::new(UnitRegistry::new()));
        let reconciler = Rc::new(Reconciler::new(
            document.clone(),
            registry.clone(),
            config.safe_mode,
        ));
        let scheduler = VisibilityScheduler::new(
            document.clone(),
            config,
            engine.clone(),
            Rc::new(processor),
            registry.clone(),
            reconciler.clone(),
            events,
        );

        tracing::debug!("页面翻译器已创建，目标语言: {}", config.target_lang);
        Ok(Self {
            document,
            config: config.clone(),
            engine,
            registry,
            reconciler,
            scheduler,
        })
    }

    /// 翻译整个文档
    pub async fn translate_page(&mut self) -> TranslationResult<PassReport> {
        let document = self.document.clone();
        self.translate_subtree(&document).await
    }

    /// 翻译一棵子树，已翻译或在途的单元不会重复提交
    pub async fn translate_subtree(&mut self, root: &Handle) -> TranslationResult<PassReport> {
        let pass = self.scheduler.translate_now(root).await?;
        tracing::info!(
            "翻译完成: {} 个单元，写回 {}，跳过 {}，失败 {}",
            pass.units,
            pass.apply.applied,
            pass.apply.skipped_missing,
            pass.apply.failed
        );
        Ok(pass)
    }

    /// 恢复原文；`None` 恢复全部
    pub fn reset(&self, descriptors: Option<&[PositionDescriptor]>) -> usize {
        self.reconciler.reset(descriptors)
    }

    pub fn abort(&self) {
        self.engine.abort();
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.engine.abort_handle()
    }

    pub fn scheduler(&mut self) -> &mut VisibilityScheduler<P> {
        &mut self.scheduler
    }

    pub fn engine(&self) -> &BatchEngine {
        &self.engine
    }

    pub fn registry(&self) -> Rc<RefCell<UnitRegistry>> {
        self.registry.clone()
    }

    pub fn counts(&self) -> RegistryCounts {
        self.registry.borrow().counts()
    }

    pub fn config(&self) -> &TranslationConfig {
        &self.config
    }
}

/// 解析 HTML、翻译整页并序列化
pub async fn translate_html<C>(
    html: &str,
    config: &TranslationConfig,
    client: C,
) -> TranslationResult<String>
where
    C: TranslationClient + 'static,
{
    config.validate()?;
    let cache = TranslationCache::from_config(config)?;
    let dom = html_to_dom(html.as_bytes(), "utf-8");
    let processor = ClientProcessor::new(client, &config.target_lang);

    let mut translator = PageTranslator::new(
        dom.document.clone(),
        config,
        cache,
        processor,
        EventSink::disabled(),
    )?;
    translator.translate_page().await?;

    let bytes = serialize_document(&dom, "utf-8")?;
    String::from_utf8(bytes).map_err(|e| TranslationError::SerializationError(e.to_string()))
}
