// 集成测试公共模块
//
// 提供测试页面、模拟翻译客户端和可观测的处理器

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use futures::future::{FutureExt, LocalBoxFuture};
use markup5ever_rcdom::RcDom;

use pagelingo::parsers::html::{html_to_dom, serialize_document};
use pagelingo::translation::{
    BatchConfig, ItemProcessor, TranslationClient, TranslationConfig, TranslationError,
    TranslationResult,
};

/// 测试页面与 DOM 工具
pub struct HtmlTestHelper;

impl HtmlTestHelper {
    pub fn create_simple_english_page() -> String {
        r#"<!DOCTYPE html>
<html lang="en">
<head><title>Test Page</title></head>
<body>
  <h1 id="top">Welcome to Test</h1>
  <p>Hello world</p>
  <p>  Padded text  </p>
  <img src="a.png" alt="A diagram" title="Diagram title">
  <pre>let x = 1;</pre>
  <script>var message = "do not translate";</script>
  <p class="notranslate">Brand name</p>
</body>
</html>"#
            .to_string()
    }

    pub fn create_test_dom(html: &str) -> RcDom {
        html_to_dom(html.as_bytes(), "utf-8")
    }

    pub fn serialize(dom: &RcDom) -> String {
        let bytes = serialize_document(dom, "utf-8").expect("serialize");
        String::from_utf8(bytes).expect("utf-8 output")
    }
}

/// 测试配置：关闭缓存，缩短重试间隔
pub fn test_config(lang: &str) -> TranslationConfig {
    let mut config = TranslationConfig::default_with_lang(lang, Some("http://127.0.0.1:9/translate"));
    config.cache_enabled = false;
    config.retry_delay_ms = 10;
    config
}

pub fn batch_config(batch_size: usize, max_concurrent_batches: usize) -> BatchConfig {
    BatchConfig {
        batch_size,
        max_concurrent_batches,
        retry_delay: Duration::from_millis(10),
        timeout: Duration::from_secs(5),
        ..BatchConfig::default()
    }
}

pub fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// 给每条文本加上 `[lang] ` 前缀的模拟客户端，记录每次调用的批量大小
#[derive(Clone, Default)]
pub struct MockClient {
    pub calls: Rc<RefCell<Vec<usize>>>,
    /// 每次调用少返回的条数
    pub drop_last: usize,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn short_by(drop_last: usize) -> Self {
        Self {
            drop_last,
            ..Self::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.borrow().len()
    }
}

impl TranslationClient for MockClient {
    fn translate_batch<'a>(
        &'a self,
        texts: &'a [String],
        target_lang: &'a str,
    ) -> LocalBoxFuture<'a, TranslationResult<Vec<String>>> {
        async move {
            self.calls.borrow_mut().push(texts.len());
            let keep = texts.len().saturating_sub(self.drop_last);
            Ok(texts
                .iter()
                .take(keep)
                .map(|t| format!("[{}] {}", target_lang, t))
                .collect())
        }
        .boxed_local()
    }
}

/// 前若干次调用失败的处理器
pub struct FlakyProcessor {
    failures: HashMap<String, usize>,
    calls: RefCell<HashMap<String, usize>>,
    error: fn() -> TranslationError,
}

impl FlakyProcessor {
    pub fn new(failures: &[(&str, usize)]) -> Self {
        Self {
            failures: failures.iter().map(|(t, n)| (t.to_string(), *n)).collect(),
            calls: RefCell::new(HashMap::new()),
            error: || TranslationError::NetworkError("connection reset".to_string()),
        }
    }

    pub fn with_error(mut self, error: fn() -> TranslationError) -> Self {
        self.error = error;
        self
    }

    pub fn calls_for(&self, text: &str) -> usize {
        self.calls.borrow().get(text).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.borrow().values().sum()
    }
}

impl ItemProcessor for FlakyProcessor {
    fn process<'a>(&'a self, text: &'a str) -> LocalBoxFuture<'a, TranslationResult<String>> {
        async move {
            let attempt = {
                let mut calls = self.calls.borrow_mut();
                let count = calls.entry(text.to_string()).or_insert(0);
                *count += 1;
                *count
            };
            let fail_times = self.failures.get(text).copied().unwrap_or(0);
            if attempt <= fail_times {
                Err((self.error)())
            } else {
                Ok(format!("T({})", text))
            }
        }
        .boxed_local()
    }
}

/// 记录同时在途批次数峰值的处理器
#[derive(Default)]
pub struct ConcurrencyProbe {
    active: Cell<usize>,
    pub peak: Cell<usize>,
    pub batches: Cell<usize>,
    pub delay: Duration,
}

impl ConcurrencyProbe {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
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
            self.active.set(self.active.get() + 1);
            self.peak.set(self.peak.get().max(self.active.get()));
            self.batches.set(self.batches.get() + 1);
            tokio::time::sleep(self.delay).await;
            self.active.set(self.active.get() - 1);
            Ok(texts.iter().map(|t| Ok(t.to_uppercase())).collect())
        }
        .boxed_local()
    }
}

/// 计数处理器：记录每次 `process` 收到的文本
#[derive(Default)]
pub struct CountingProcessor {
    pub seen: RefCell<Vec<String>>,
}

impl ItemProcessor for CountingProcessor {
    fn process<'a>(&'a self, text: &'a str) -> LocalBoxFuture<'a, TranslationResult<String>> {
        async move {
            self.seen.borrow_mut().push(text.to_string());
            Ok(format!("<{}>", text))
        }
        .boxed_local()
    }
}

/// 断言工具
pub struct AssertionHelper;

impl AssertionHelper {
    pub fn assert_contains(haystack: &str, needle: &str) {
        assert!(
            haystack.contains(needle),
            "expected output to contain {:?}\n--- output ---\n{}",
            needle,
            haystack
        );
    }

    pub fn assert_not_contains(haystack: &str, needle: &str) {
        assert!(
            !haystack.contains(needle),
            "expected output not to contain {:?}\n--- output ---\n{}",
            needle,
            haystack
        );
    }
}
