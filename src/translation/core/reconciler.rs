//! 译文回写
//!
//! 优先按提取时记住的节点写回；节点已脱离文档时再用位置描述符重新定位。
//! 写回时保存原文，以便之后按单元或整体恢复。定位失败说明内容已经变化，直接跳过。

use std::cell::RefCell;
use std::rc::Rc;

use markup5ever_rcdom::{Handle, NodeData};
use serde::Serialize;

use crate::parsers::html::dom::{get_node_attr, is_attached_to, set_node_attr};
use crate::translation::error::{TranslationError, TranslationResult};
use crate::translation::pipeline::addressing::{Addresser, Location, LocationRef, PositionDescriptor};
use crate::translation::pipeline::collector::TextUnit;
use crate::translation::pipeline::state::{UnitRegistry, UnitState};

/// 一条待回写的翻译结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationItem {
    pub original: String,
    /// None 表示翻译失败
    pub translated: Option<String>,
    pub descriptor: PositionDescriptor,
    #[serde(skip)]
    pub origin: LocationRef,
}

impl TranslationItem {
    /// 只有描述符的结果，按当前树结构定位
    pub fn new(original: &str, translated: Option<String>, descriptor: PositionDescriptor) -> Self {
        Self {
            original: original.to_string(),
            translated,
            descriptor,
            origin: LocationRef::default(),
        }
    }

    pub fn from_unit(unit: &TextUnit, translated: Option<String>) -> Self {
        Self {
            original: unit.text.clone(),
            translated,
            descriptor: unit.descriptor.clone(),
            origin: unit.origin.clone(),
        }
    }
}

/// 单次回写统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyReport {
    pub applied: usize,
    pub skipped_missing: usize,
    pub unchanged: usize,
    pub released: usize,
    pub failed: usize,
}

impl ApplyReport {
    pub fn merge(&mut self, other: ApplyReport) {
        self.applied += other.applied;
        self.skipped_missing += other.skipped_missing;
        self.unchanged += other.unchanged;
        self.released += other.released;
        self.failed += other.failed;
    }
}

/// DOM 回写器，是内容与 translated 状态的唯一写入方
pub struct Reconciler {
    addresser: Addresser,
    registry: Rc<RefCell<UnitRegistry>>,
    safe_mode: bool,
}

impl Reconciler {
    pub fn new(document: Handle, registry: Rc<RefCell<UnitRegistry>>, safe_mode: bool) -> Self {
        Self {
            addresser: Addresser::new(document),
            registry,
            safe_mode,
        }
    }

    pub fn safe_mode(&self) -> bool {
        self.safe_mode
    }

    /// 回写一组翻译结果，单项失败不影响其余项
    pub fn apply(&self, items: &[TranslationItem]) -> ApplyReport {
        let mut report = ApplyReport::default();

        for item in items {
            let Some(location) = self.locate(item) else {
                tracing::trace!("位置已消失，跳过: {}", item.descriptor);
                report.skipped_missing += 1;
                continue;
            };

            let Some(translated) = item.translated.as_deref() else {
                if self.registry.borrow_mut().release(&location) {
                    report.released += 1;
                }
                continue;
            };

            match self.write_translation(&location, &item.original, translated) {
                Ok(true) => report.applied += 1,
                Ok(false) => report.unchanged += 1,
                Err(error) => {
                    report.failed += 1;
                    if self.safe_mode {
                        self.registry.borrow_mut().release(&location);
                    }
                    tracing::warn!("回写失败 {}: {}", item.descriptor, error);
                }
            }
        }

        if report.failed > 0 || report.skipped_missing > 0 {
            tracing::debug!("回写完成: {:?}", report);
        }
        report
    }

    /// 按提取时的节点交还一组单元；没有节点记录的单元按描述符处理
    pub fn release_units(&self, units: &[TextUnit]) -> usize {
        let mut released = 0;
        let mut unanchored = Vec::new();

        for unit in units {
            if !unit.origin.is_set() {
                unanchored.push(unit.descriptor.clone());
                continue;
            }
            if let Some(location) = unit.origin.upgrade() {
                if self.registry.borrow_mut().release(&location) {
                    released += 1;
                }
            }
        }

        released + self.release(&unanchored)
    }

    /// 把失败或未翻译的单元还给 untouched，允许之后重新提交
    pub fn release(&self, descriptors: &[PositionDescriptor]) -> usize {
        let mut registry = self.registry.borrow_mut();
        descriptors
            .iter()
            .filter_map(|descriptor| self.addresser.resolve(descriptor).found())
            .filter(|location| registry.release(location))
            .count()
    }

    /// 恢复原文；`None` 表示恢复全部已翻译单元
    pub fn reset(&self, descriptors: Option<&[PositionDescriptor]>) -> usize {
        let targets: Vec<Location> = match descriptors {
            Some(descriptors) => descriptors
                .iter()
                .filter_map(|descriptor| self.addresser.resolve(descriptor).found())
                .collect(),
            None => self
                .registry
                .borrow()
                .translated_entries()
                .into_iter()
                .map(|(location, _)| location)
                .collect(),
        };

        let mut restored = 0;
        for location in targets {
            let original = self.registry.borrow_mut().take_original(&location);
            let Some(original) = original else {
                continue;
            };
            match write_value(&location, &original) {
                Ok(()) => restored += 1,
                Err(error) => tracing::warn!("恢复原文失败: {}", error),
            }
        }

        tracing::info!("已恢复 {} 个单元的原文", restored);
        restored
    }

    /// 提取时的节点仍在文档中就直接使用；已脱离时交还它，再按描述符定位
    fn locate(&self, item: &TranslationItem) -> Option<Location> {
        if let Some(origin) = item.origin.upgrade() {
            if is_attached_to(origin.node(), self.addresser.document()) {
                return Some(origin);
            }
            self.registry.borrow_mut().release(&origin);
        }
        self.addresser.resolve(&item.descriptor).found()
    }

    /// 返回 Ok(false) 表示译文与原文相同，不写入
    fn write_translation(
        &self,
        location: &Location,
        original: &str,
        translated: &str,
    ) -> TranslationResult<bool> {
        if self.registry.borrow().state(location) == UnitState::Translated {
            return Err(TranslationError::WriteError("单元已被翻译".to_string()));
        }

        let current = location
            .read()
            .ok_or_else(|| TranslationError::WriteError("位置不可读".to_string()))?;

        if current.trim() != original.trim() {
            return Err(TranslationError::WriteError("内容在提取后已被修改".to_string()));
        }

        let translated = translated.trim();
        if translated.is_empty() || translated == original.trim() {
            self.registry
                .borrow_mut()
                .mark_translated(location, current);
            return Ok(false);
        }

        let replacement = preserve_padding(&current, translated);
        write_value(location, &replacement)?;
        self.registry
            .borrow_mut()
            .mark_translated(location, current);
        Ok(true)
    }
}

/// 保留原值首尾空白
fn preserve_padding(current: &str, translated: &str) -> String {
    let leading = &current[..current.len() - current.trim_start().len()];
    let trailing = &current[current.trim_end().len()..];
    format!("{}{}{}", leading, translated, trailing)
}

fn write_value(location: &Location, value: &str) -> TranslationResult<()> {
    match location {
        Location::Text(node) => match &node.data {
            NodeData::Text { contents } => {
                let mut contents = contents
                    .try_borrow_mut()
                    .map_err(|_| TranslationError::WriteError("文本节点正被占用".to_string()))?;
                *contents = value.into();
                Ok(())
            }
            _ => Err(TranslationError::WriteError("目标不是文本节点".to_string())),
        },
        Location::Attribute { element, name } => {
            if get_node_attr(element, name).is_none() {
                return Err(TranslationError::WriteError(format!("属性 {} 不存在", name)));
            }
            set_node_attr(element, name, Some(value.to_string()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::html::dom::{html_to_dom, parse_fragment, append_child, find_element_by_id};
    use crate::parsers::html::serializer::serialize_document;
    use crate::translation::pipeline::collector::{CollectorConfig, TextCollector};

    const PAGE: &str = r#"<html><head><title>Doc</title></head><body>
        <p id="intro">  Hello world  </p>
        <img id="pic" alt="A cat" src="cat.png">
        <div><span>Second line</span></div>
    </body></html>"#;

    fn setup() -> (markup5ever_rcdom::RcDom, Rc<RefCell<UnitRegistry>>, Vec<TextUnit>) {
        let dom = html_to_dom(PAGE.as_bytes(), "utf-8");
        let registry = Rc::new(RefCell::new(UnitRegistry::new()));
        let mut collector = TextCollector::new(
            CollectorConfig::default(),
            dom.document.clone(),
            registry.clone(),
        );
        let units = collector.extract(&dom.document);
        (dom, registry, units)
    }

    fn shout(units: &[TextUnit]) -> Vec<TranslationItem> {
        units
            .iter()
            .map(|u| TranslationItem::from_unit(u, Some(u.text.to_uppercase())))
            .collect()
    }

    #[test]
    fn test_apply_writes_and_preserves_padding() {
        let (dom, registry, units) = setup();
        let reconciler = Reconciler::new(dom.document.clone(), registry.clone(), true);

        let report = reconciler.apply(&shout(&units));
        assert_eq!(report.applied, units.len());

        let intro = find_element_by_id(&dom.document, "intro").unwrap();
        let text = intro.children.borrow()[0].clone();
        assert_eq!(Location::text(&text).read().unwrap(), "  HELLO WORLD  ");

        let pic = find_element_by_id(&dom.document, "pic").unwrap();
        assert_eq!(get_node_attr(&pic, "alt").as_deref(), Some("A CAT"));
        assert_eq!(registry.borrow().counts().translated, units.len());
    }

    #[test]
    fn test_reset_restores_bytes() {
        let (dom, registry, units) = setup();
        let before = serialize_document(&dom, "utf-8").unwrap();
        let reconciler = Reconciler::new(dom.document.clone(), registry.clone(), true);

        reconciler.apply(&shout(&units));
        assert_ne!(serialize_document(&dom, "utf-8").unwrap(), before);

        let restored = reconciler.reset(None);
        assert_eq!(restored, units.len());
        assert_eq!(serialize_document(&dom, "utf-8").unwrap(), before);
        assert!(registry.borrow().is_empty());
    }

    #[test]
    fn test_reset_selected_units_only() {
        let (dom, registry, units) = setup();
        let reconciler = Reconciler::new(dom.document.clone(), registry.clone(), true);
        reconciler.apply(&shout(&units));

        let alt = units.iter().find(|u| u.text == "A cat").unwrap();
        assert_eq!(reconciler.reset(Some(&[alt.descriptor.clone()])), 1);

        let pic = find_element_by_id(&dom.document, "pic").unwrap();
        assert_eq!(get_node_attr(&pic, "alt").as_deref(), Some("A cat"));
        assert_eq!(registry.borrow().counts().translated, units.len() - 1);
    }

    #[test]
    fn test_vanished_location_is_skipped() {
        let (dom, registry, units) = setup();
        let reconciler = Reconciler::new(dom.document.clone(), registry, true);

        let intro = find_element_by_id(&dom.document, "intro").unwrap();
        crate::parsers::html::dom::detach(&intro);

        let report = reconciler.apply(&shout(&units));
        assert_eq!(report.skipped_missing, 1);
        assert_eq!(report.applied, units.len() - 1);
    }

    #[test]
    fn test_changed_content_fails_and_safe_mode_releases() {
        for safe_mode in [true, false] {
            let (dom, registry, units) = setup();
            let reconciler = Reconciler::new(dom.document.clone(), registry.clone(), safe_mode);

            let pic = find_element_by_id(&dom.document, "pic").unwrap();
            set_node_attr(&pic, "alt", Some("A dog".to_string()));

            let alt = units.iter().find(|u| u.text == "A cat").unwrap();
            let report = reconciler.apply(&[TranslationItem::from_unit(alt, Some("CAT".to_string()))]);
            assert_eq!(report.failed, 1);

            let expected = if safe_mode {
                UnitState::Untouched
            } else {
                UnitState::Pending
            };
            assert_eq!(
                registry.borrow().state(&Location::attribute(&pic, "alt")),
                expected
            );
        }
    }

    fn body_of(dom: &markup5ever_rcdom::RcDom) -> Handle {
        crate::parsers::html::dom::find_nodes(&dom.document, vec!["html", "body"]).remove(0)
    }

    fn prepend(parent: &Handle, html: &str) {
        for node in parse_fragment(html).into_iter().rev() {
            node.parent.set(Some(Rc::downgrade(parent)));
            parent.children.borrow_mut().insert(0, node);
        }
    }

    #[test]
    fn test_sibling_inserted_before_pending_unit() {
        let dom = html_to_dom(b"<html><body><p>Alpha text</p></body></html>", "utf-8");
        let registry = Rc::new(RefCell::new(UnitRegistry::new()));
        let mut collector =
            TextCollector::new(CollectorConfig::default(), dom.document.clone(), registry.clone());
        let units = collector.extract(&dom.document);
        let alpha = units[0].origin.upgrade().unwrap();

        prepend(&body_of(&dom), "<p>Banner</p>");

        let reconciler = Reconciler::new(dom.document.clone(), registry.clone(), true);
        let report = reconciler.apply(&[TranslationItem::from_unit(&units[0], Some("ALPHA".to_string()))]);
        assert_eq!(report.applied, 1, "{:?}", report);
        assert_eq!(registry.borrow().state(&alpha), UnitState::Translated);

        let html = String::from_utf8(serialize_document(&dom, "utf-8").unwrap()).unwrap();
        assert!(html.contains("<p>Banner</p><p>ALPHA</p>"), "{}", html);

        let next: Vec<String> = collector.extract(&dom.document).into_iter().map(|u| u.text).collect();
        assert_eq!(next, vec!["Banner".to_string()]);
    }

    #[test]
    fn test_release_units_follows_origin() {
        let dom = html_to_dom(b"<html><body><p>Alpha text</p></body></html>", "utf-8");
        let registry = Rc::new(RefCell::new(UnitRegistry::new()));
        let mut collector =
            TextCollector::new(CollectorConfig::default(), dom.document.clone(), registry.clone());
        let units = collector.extract(&dom.document);

        prepend(&body_of(&dom), "<p>Banner</p>");
        let banner = collector.extract(&dom.document);
        assert_eq!(banner[0].descriptor, units[0].descriptor, "same address, different node");

        let reconciler = Reconciler::new(dom.document.clone(), registry.clone(), true);
        assert_eq!(reconciler.release_units(&units), 1);
        assert_eq!(registry.borrow().state(&units[0].origin.upgrade().unwrap()), UnitState::Untouched);
        assert_eq!(registry.borrow().state(&banner[0].origin.upgrade().unwrap()), UnitState::Pending);
    }

    #[test]
    fn test_detached_origin_is_released() {
        let (dom, registry, units) = setup();
        let reconciler = Reconciler::new(dom.document.clone(), registry.clone(), true);
        let intro = find_element_by_id(&dom.document, "intro").unwrap();
        let hello = units.iter().find(|u| u.text == "Hello world").unwrap();

        crate::parsers::html::dom::detach(&intro);
        let report = reconciler.apply(&[TranslationItem::from_unit(hello, Some("HI".to_string()))]);

        assert_eq!(report.skipped_missing, 1);
        assert_eq!(registry.borrow().state(&hello.origin.upgrade().unwrap()), UnitState::Untouched);
    }

    #[test]
    fn test_failed_translation_releases_unit() {
        let (dom, registry, units) = setup();
        let reconciler = Reconciler::new(dom.document.clone(), registry.clone(), true);

        let items: Vec<TranslationItem> =
            units.iter().map(|u| TranslationItem::from_unit(u, None)).collect();
        let report = reconciler.apply(&items);

        assert_eq!(report.released, units.len());
        assert_eq!(registry.borrow().counts().pending, 0);
    }

    #[test]
    fn test_identical_translation_counts_as_unchanged() {
        let (dom, registry, units) = setup();
        let reconciler = Reconciler::new(dom.document.clone(), registry.clone(), true);

        let items: Vec<TranslationItem> = units
            .iter()
            .map(|u| TranslationItem::from_unit(u, Some(u.text.clone())))
            .collect();
        let report = reconciler.apply(&items);
        assert_eq!(report.unchanged, units.len());
        assert_eq!(report.applied, 0);
    }

    #[test]
    fn test_inserted_fragment_can_be_applied() {
        let (dom, registry, _) = setup();
        let body = crate::parsers::html::dom::find_nodes(&dom.document, vec!["html", "body"])
            .into_iter()
            .next()
            .unwrap();
        for node in parse_fragment("<p>Fresh text</p>") {
            append_child(&body, &node);
        }

        let mut collector =
            TextCollector::new(CollectorConfig::default(), dom.document.clone(), registry.clone());
        let units = collector.extract(&body);
        assert_eq!(units.len(), 1);

        let reconciler = Reconciler::new(dom.document.clone(), registry, true);
        assert_eq!(reconciler.apply(&shout(&units)).applied, 1);
    }
}
