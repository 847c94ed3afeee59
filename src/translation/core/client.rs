//! 翻译客户端
//!
//! 流水线不规定远端协议，只要求结果与输入逐项对齐。HTTP 实现发送
//! `{texts, targetLang}`，期望得到 `{translations}`。

use std::time::Duration;

use futures::future::{FutureExt, LocalBoxFuture};
use serde::{Deserialize, Serialize};

use crate::translation::config::TranslationConfig;
use crate::translation::error::{TranslationError, TranslationResult};
use crate::translation::pipeline::batch::ItemProcessor;

/// 远端翻译调用
pub trait TranslationClient {
    fn translate_batch<'a>(
        &'a self,
        texts: &'a [String],
        target_lang: &'a str,
    ) -> LocalBoxFuture<'a, TranslationResult<Vec<String>>>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TranslateRequest<'a> {
    texts: &'a [String],
    target_lang: &'a str,
}

#[derive(Debug, Deserialize)]
struct TranslateResponse {
    translations: Vec<String>,
}

/// 基于 reqwest 的 HTTP 客户端
#[derive(Debug, Clone)]
pub struct HttpTranslationClient {
    http: reqwest::Client,
    api_url: String,
}

impl HttpTranslationClient {
    pub fn new(api_url: &str, timeout: Duration) -> TranslationResult<Self> {
        if api_url.trim().is_empty() {
            return Err(TranslationError::ConfigError("API地址不能为空".to_string()));
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| TranslationError::ConfigError(format!("创建HTTP客户端失败: {}", e)))?;

        Ok(Self {
            http,
            api_url: api_url.to_string(),
        })
    }

    pub fn from_config(config: &TranslationConfig) -> TranslationResult<Self> {
        Self::new(&config.api_url, config.timeout())
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    async fn send(&self, texts: &[String], target_lang: &str) -> TranslationResult<Vec<String>> {
        let response = self
            .http
            .post(&self.api_url)
            .json(&TranslateRequest { texts, target_lang })
            .send()
            .await
            .map_err(|e| TranslationError::from(e).with_context(&self.api_url))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(TranslationError::RateLimitExceeded);
        }
        if !status.is_success() {
            return Err(TranslationError::NetworkError(format!(
                "翻译服务返回 {}",
                status
            )));
        }

        let body: TranslateResponse = response.json().await?;
        Ok(align_results(texts, body.translations))
    }
}

impl TranslationClient for HttpTranslationClient {
    fn translate_batch<'a>(
        &'a self,
        texts: &'a [String],
        target_lang: &'a str,
    ) -> LocalBoxFuture<'a, TranslationResult<Vec<String>>> {
        async move {
            if texts.is_empty() {
                return Ok(Vec::new());
            }
            tracing::debug!("发送翻译请求: {} 条文本 -> {}", texts.len(), target_lang);
            self.send(texts, target_lang).await
        }
        .boxed_local()
    }
}

/// 把后端结果修正为与输入等长：不足补原文，多余截断
pub fn align_results(texts: &[String], mut translations: Vec<String>) -> Vec<String> {
    if translations.len() != texts.len() {
        tracing::warn!(
            "翻译结果数量不匹配: 期望 {}, 实际 {}",
            texts.len(),
            translations.len()
        );
        if translations.len() > texts.len() {
            translations.truncate(texts.len());
        } else {
            let missing = translations.len();
            translations.extend(texts[missing..].iter().cloned());
        }
    }
    translations
}

/// 把客户端适配为批次引擎的处理器
///
/// 首次尝试每批一次调用；重试时单条调用。
pub struct ClientProcessor<C> {
    client: C,
    target_lang: String,
}

impl<C: TranslationClient> ClientProcessor<C> {
    pub fn new(client: C, target_lang: &str) -> Self {
        Self {
            client,
            target_lang: target_lang.to_string(),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }
}

impl<C: TranslationClient> ItemProcessor for ClientProcessor<C> {
    fn process<'a>(&'a self, text: &'a str) -> LocalBoxFuture<'a, TranslationResult<String>> {
        async move {
            let texts = [text.to_string()];
            let mut translated = self.client.translate_batch(&texts, &self.target_lang).await?;
            translated
                .pop()
                .ok_or_else(|| TranslationError::TranslationServiceError("翻译结果为空".to_string()))
        }
        .boxed_local()
    }

    fn process_batch<'a>(
        &'a self,
        texts: &'a [String],
    ) -> LocalBoxFuture<'a, TranslationResult<Vec<TranslationResult<String>>>> {
        async move {
            let translated = self.client.translate_batch(texts, &self.target_lang).await?;
            Ok(align_results(texts, translated).into_iter().map(Ok).collect())
        }
        .boxed_local()
    }
}
