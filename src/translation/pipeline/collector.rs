//! 文本单元提取器
//!
//! 遍历子树，按排除规则和文本过滤器收集文本节点与可翻译属性，
//! 为每个单元生成位置描述符，并在登记表中标记为 pending。

use std::cell::RefCell;
use std::rc::Rc;

use markup5ever_rcdom::{Handle, NodeData};
use serde::{Deserialize, Serialize};

use super::addressing::{Addresser, IdIndex, Location, LocationRef, PositionDescriptor, UnitKind};
use super::filters::{ExclusionRules, TextFilter};
use super::state::{UnitRegistry, UnitState};
use crate::parsers::html::dom::{get_node_attr, get_parent_node, is_attached_to};
use crate::translation::config::{constants, TranslationConfig};

/// 一个待翻译的最小文本单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextUnit {
    /// 裁剪后的文本
    pub text: String,
    pub descriptor: PositionDescriptor,
    pub kind: UnitKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute_name: Option<String>,
    /// 提取时的节点，写回和交还都以它为准
    #[serde(skip)]
    pub origin: LocationRef,
}

/// 提取器配置
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// 最大遍历深度
    pub max_depth: usize,
    /// 收集的属性列表
    pub collect_attributes: Vec<String>,
    /// 最小文本长度
    pub min_text_length: usize,
    /// 额外的排除选择器
    pub exclude_selectors: Vec<String>,
    /// 分块提取时每访问多少节点让出一次
    pub yield_every: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            max_depth: constants::MAX_WALK_DEPTH,
            collect_attributes: constants::TRANSLATABLE_ATTRS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            min_text_length: constants::MIN_TEXT_LENGTH,
            exclude_selectors: Vec::new(),
            yield_every: constants::DEFAULT_YIELD_EVERY,
        }
    }
}

impl From<&TranslationConfig> for CollectorConfig {
    fn from(config: &TranslationConfig) -> Self {
        Self {
            max_depth: constants::MAX_WALK_DEPTH,
            collect_attributes: config.translatable_attrs.clone(),
            min_text_length: config.min_text_length,
            exclude_selectors: config.exclude_selectors.clone(),
            yield_every: config.yield_every.max(1),
        }
    }
}

/// 单次提取统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionStats {
    pub nodes_visited: usize,
    pub nodes_skipped: usize,
    pub text_nodes_found: usize,
    pub attributes_found: usize,
    pub units_emitted: usize,
    pub filtered: usize,
    pub already_handled: usize,
}

struct Walk {
    stack: Vec<(Handle, usize)>,
    units: Vec<TextUnit>,
    ids: IdIndex,
}

/// DOM文本提取器
pub struct TextCollector {
    config: CollectorConfig,
    rules: ExclusionRules,
    filter: TextFilter,
    addresser: Addresser,
    registry: Rc<RefCell<UnitRegistry>>,
    stats: ExtractionStats,
}

impl TextCollector {
    pub fn new(config: CollectorConfig, document: Handle, registry: Rc<RefCell<UnitRegistry>>) -> Self {
        let rules = ExclusionRules::from_selectors(&config.exclude_selectors);
        let filter = TextFilter::new(config.min_text_length);

        Self {
            config,
            rules,
            filter,
            addresser: Addresser::new(document),
            registry,
            stats: ExtractionStats::default(),
        }
    }

    /// 提取子树中的全部文本单元
    pub fn extract(&mut self, root: &Handle) -> Vec<TextUnit> {
        let Some(mut walk) = self.begin(root) else {
            return Vec::new();
        };
        while self.step(&mut walk) {}
        self.finish(walk)
    }

    /// 分块提取，每访问 `yield_every` 个节点让出一次执行权
    pub async fn extract_yielding(&mut self, root: &Handle) -> Vec<TextUnit> {
        let Some(mut walk) = self.begin(root) else {
            return Vec::new();
        };

        let mut since_yield = 0;
        while self.step(&mut walk) {
            since_yield += 1;
            if since_yield >= self.config.yield_every {
                since_yield = 0;
                tokio::task::yield_now().await;
                // 让出期间 id 可能被插入或移除
                walk.ids = IdIndex::build(self.addresser.document());
            }
        }
        self.finish(walk)
    }

    pub fn stats(&self) -> &ExtractionStats {
        &self.stats
    }

    pub fn rules(&self) -> &ExclusionRules {
        &self.rules
    }

    fn begin(&mut self, root: &Handle) -> Option<Walk> {
        self.stats = ExtractionStats::default();

        if !is_attached_to(root, self.addresser.document()) {
            tracing::debug!("提取根节点不在文档中，跳过");
            return None;
        }

        // 祖先被排除时整个子树都不提取
        let mut ancestor = get_parent_node(root);
        while let Some(node) = ancestor {
            if self.rules.excludes(&node) {
                self.stats.nodes_skipped += 1;
                return None;
            }
            ancestor = get_parent_node(&node);
        }

        Some(Walk {
            stack: vec![(root.clone(), 0)],
            units: Vec::new(),
            ids: IdIndex::build(self.addresser.document()),
        })
    }

    fn finish(&mut self, walk: Walk) -> Vec<TextUnit> {
        tracing::debug!(
            "提取完成: 访问 {} 个节点, 产生 {} 个单元, 过滤 {} 个",
            self.stats.nodes_visited,
            self.stats.units_emitted,
            self.stats.filtered
        );
        walk.units
    }

    /// 处理一个节点，栈空时返回 false
    fn step(&mut self, walk: &mut Walk) -> bool {
        let Some((node, depth)) = walk.stack.pop() else {
            return false;
        };

        if depth > self.config.max_depth {
            self.stats.nodes_skipped += 1;
            return true;
        }

        self.stats.nodes_visited += 1;

        match &node.data {
            NodeData::Text { contents } => {
                self.stats.text_nodes_found += 1;
                let text = contents.borrow().to_string();
                self.consider(Location::text(&node), &text, walk);
            }
            NodeData::Element { .. } => {
                if self.rules.excludes(&node) {
                    self.stats.nodes_skipped += 1;
                    return true;
                }

                let attributes: Vec<(Location, String)> = self
                    .config
                    .collect_attributes
                    .iter()
                    .filter_map(|name| {
                        get_node_attr(&node, name).map(|value| (Location::attribute(&node, name), value))
                    })
                    .collect();
                for (location, value) in attributes {
                    self.stats.attributes_found += 1;
                    self.consider(location, &value, walk);
                }

                Self::push_children(&node, depth, walk);
            }
            NodeData::Document => Self::push_children(&node, depth, walk),
            _ => {}
        }

        true
    }

    fn push_children(node: &Handle, depth: usize, walk: &mut Walk) {
        let children = node.children.borrow();
        walk.stack
            .extend(children.iter().rev().map(|child| (child.clone(), depth + 1)));
    }

    fn consider(&mut self, location: Location, raw: &str, walk: &mut Walk) {
        if !self.filter.should_translate(raw) {
            self.stats.filtered += 1;
            return;
        }

        if self.registry.borrow().state(&location) != UnitState::Untouched {
            self.stats.already_handled += 1;
            return;
        }

        let Some(descriptor) = self.addresser.describe_indexed(&location, &walk.ids) else {
            return;
        };

        if !self.registry.borrow_mut().mark_pending(&location) {
            self.stats.already_handled += 1;
            return;
        }

        walk.units.push(TextUnit {
            text: raw.trim().to_string(),
            descriptor,
            kind: location.kind(),
            attribute_name: location.attr_name().map(str::to_string),
            origin: LocationRef::new(&location),
        });
        self.stats.units_emitted += 1;
    }
}
