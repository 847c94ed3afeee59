//! 过滤规则
//!
//! - `TextFilter`：判断一段文本是否值得翻译
//! - `Selector` / `ExclusionRules`：判断元素子树是否应被跳过

use std::collections::HashSet;
use std::sync::OnceLock;

use markup5ever_rcdom::Handle;
use regex::Regex;

use crate::parsers::html::dom::{get_node_attr, get_node_name};
use crate::translation::config::constants;
use crate::translation::error::{TranslationError, TranslationResult};

// ============================================================================
// 文本过滤
// ============================================================================

/// 文本被过滤的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterReason {
    TooShort,
    NoLetters,
    Url,
    Email,
}

/// 文本过滤器
#[derive(Debug, Clone)]
pub struct TextFilter {
    min_text_length: usize,
}

fn url_regex() -> &'static Regex {
    static URL: OnceLock<Regex> = OnceLock::new();
    URL.get_or_init(|| Regex::new(r"^(https?|ftp)://\S+$").expect("valid url pattern"))
}

fn email_regex() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("valid email pattern")
    })
}

impl TextFilter {
    pub fn new(min_text_length: usize) -> Self {
        Self {
            min_text_length: min_text_length.max(1),
        }
    }

    /// 判断文本是否需要翻译
    pub fn should_translate(&self, text: &str) -> bool {
        self.reject_reason(text).is_none()
    }

    /// 返回拒绝原因，可翻译时为 None
    pub fn reject_reason(&self, text: &str) -> Option<FilterReason> {
        let trimmed = text.trim();

        if trimmed.chars().count() < self.min_text_length {
            return Some(FilterReason::TooShort);
        }

        // 纯数字、标点、符号
        if !trimmed.chars().any(|c| c.is_alphabetic()) {
            return Some(FilterReason::NoLetters);
        }

        if url_regex().is_match(trimmed) {
            return Some(FilterReason::Url);
        }

        if trimmed.len() <= 100 && email_regex().is_match(trimmed) {
            return Some(FilterReason::Email);
        }

        None
    }
}

impl Default for TextFilter {
    fn default() -> Self {
        Self::new(constants::MIN_TEXT_LENGTH)
    }
}

// ============================================================================
// 选择器
// ============================================================================

/// 简单选择器：`tag`、`.class`、`#id`、`[attr]`、`[attr=value]` 及其组合
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<(String, Option<String>)>,
}

fn selector_regex() -> &'static Regex {
    static SELECTOR: OnceLock<Regex> = OnceLock::new();
    SELECTOR.get_or_init(|| {
        Regex::new(
            r#"^(?:[a-zA-Z][a-zA-Z0-9-]*|\*)?(?:\.[\w-]+|#[\w-]+|\[[\w-]+(?:=(?:"[^"]*"|'[^']*'|[^\]"']*))?\])*$"#,
        )
        .expect("valid selector pattern")
    })
}

fn selector_part_regex() -> &'static Regex {
    static PART: OnceLock<Regex> = OnceLock::new();
    PART.get_or_init(|| {
        Regex::new(
            r#"\.([\w-]+)|#([\w-]+)|\[([\w-]+)(?:=(?:"([^"]*)"|'([^']*)'|([^\]"']*)))?\]"#,
        )
        .expect("valid selector part pattern")
    })
}

impl Selector {
    pub fn parse(source: &str) -> TranslationResult<Self> {
        let source = source.trim();
        if source.is_empty() || !selector_regex().is_match(source) {
            return Err(TranslationError::InvalidInput(format!(
                "无法解析的排除选择器: {:?}",
                source
            )));
        }

        let tag_end = source
            .find(|c: char| matches!(c, '.' | '#' | '['))
            .unwrap_or(source.len());
        let tag = match &source[..tag_end] {
            "" | "*" => None,
            tag => Some(tag.to_ascii_lowercase()),
        };

        let mut selector = Selector {
            tag,
            id: None,
            classes: Vec::new(),
            attrs: Vec::new(),
        };

        for caps in selector_part_regex().captures_iter(&source[tag_end..]) {
            if let Some(class) = caps.get(1) {
                selector.classes.push(class.as_str().to_string());
            } else if let Some(id) = caps.get(2) {
                selector.id = Some(id.as_str().to_string());
            } else if let Some(name) = caps.get(3) {
                let value = caps
                    .get(4)
                    .or_else(|| caps.get(5))
                    .or_else(|| caps.get(6))
                    .map(|m| m.as_str().to_string());
                selector
                    .attrs
                    .push((name.as_str().to_ascii_lowercase(), value));
            }
        }

        Ok(selector)
    }

    pub fn matches(&self, element: &Handle) -> bool {
        let Some(name) = get_node_name(element) else {
            return false;
        };

        if let Some(tag) = &self.tag {
            if !name.eq_ignore_ascii_case(tag) {
                return false;
            }
        }

        if let Some(id) = &self.id {
            if get_node_attr(element, "id").as_deref() != Some(id.as_str()) {
                return false;
            }
        }

        if !self.classes.is_empty() {
            let class_attr = get_node_attr(element, "class").unwrap_or_default();
            let classes: HashSet<&str> = class_attr.split_whitespace().collect();
            if !self.classes.iter().all(|c| classes.contains(c.as_str())) {
                return false;
            }
        }

        self.attrs.iter().all(|(name, expected)| {
            match (get_node_attr(element, name), expected) {
                (Some(_), None) => true,
                (Some(actual), Some(expected)) => &actual == expected,
                (None, _) => false,
            }
        })
    }
}

// ============================================================================
// 排除规则
// ============================================================================

fn hidden_style_regex() -> &'static Regex {
    static HIDDEN: OnceLock<Regex> = OnceLock::new();
    HIDDEN.get_or_init(|| {
        Regex::new(r"(display\s*:\s*none|visibility\s*:\s*hidden)").expect("valid style pattern")
    })
}

/// 元素排除规则集
#[derive(Debug, Clone)]
pub struct ExclusionRules {
    skip_tags: HashSet<String>,
    selectors: Vec<Selector>,
}

impl ExclusionRules {
    /// 内置默认规则
    pub fn default_rules() -> Self {
        Self {
            skip_tags: constants::SKIP_ELEMENTS.iter().map(|s| s.to_string()).collect(),
            selectors: Vec::new(),
        }
    }

    /// 由用户选择器构建；任一选择器非法时记录警告并退回默认规则
    pub fn from_selectors(selectors: &[String]) -> Self {
        match Self::try_from_selectors(selectors) {
            Ok(rules) => rules,
            Err(e) => {
                tracing::warn!("排除规则无效，使用默认规则: {}", e);
                Self::default_rules()
            }
        }
    }

    pub fn try_from_selectors(selectors: &[String]) -> TranslationResult<Self> {
        let parsed = selectors
            .iter()
            .map(|s| Selector::parse(s))
            .collect::<TranslationResult<Vec<_>>>()?;

        let mut rules = Self::default_rules();
        rules.selectors = parsed;
        Ok(rules)
    }

    pub fn selector_count(&self) -> usize {
        self.selectors.len()
    }

    /// 元素（及其子树）是否被排除
    pub fn excludes(&self, element: &Handle) -> bool {
        let Some(name) = get_node_name(element) else {
            return false;
        };

        if self.skip_tags.contains(&name.to_ascii_lowercase()) {
            return true;
        }

        if is_hidden(element) || opts_out(element) {
            return true;
        }

        self.selectors.iter().any(|selector| selector.matches(element))
    }
}

impl Default for ExclusionRules {
    fn default() -> Self {
        Self::default_rules()
    }
}

/// 不可见元素
fn is_hidden(element: &Handle) -> bool {
    if get_node_attr(element, "hidden").is_some() {
        return true;
    }

    if get_node_attr(element, "aria-hidden").as_deref() == Some("true") {
        return true;
    }

    get_node_attr(element, "style")
        .map(|style| hidden_style_regex().is_match(&style.to_ascii_lowercase()))
        .unwrap_or(false)
}

/// 显式声明不翻译
fn opts_out(element: &Handle) -> bool {
    if get_node_attr(element, "translate")
        .map(|v| v.trim().eq_ignore_ascii_case("no"))
        .unwrap_or(false)
    {
        return true;
    }

    get_node_attr(element, "class")
        .map(|classes| classes.split_whitespace().any(|c| c == "notranslate"))
        .unwrap_or(false)
}
