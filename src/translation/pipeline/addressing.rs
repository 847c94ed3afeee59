//! 位置寻址
//!
//! 为文本节点和元素属性生成可序列化、可重新解析的位置描述符。
//!
//! 描述符格式：`<锚点><路径段>::<目标>`
//!
//! - 锚点：`/` 表示文档根，`#<id>` 表示最近的、在文档中唯一的 id 祖先（id 经过百分号编码）
//! - 路径段：`/tag[n]`，n 为同名兄弟元素中的序号（从 1 开始）
//! - 目标：`text[k]`（非空白文本子节点序号，从 0 开始）或 `@属性名`
//!
//! 例如 `/html[1]/body[1]/p[2]::text[0]`、`#main/ul[1]/li[3]::@title`

use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use markup5ever_rcdom::{Handle, Node, NodeData};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};

use crate::parsers::html::dom::{
    find_elements_by_id, get_node_attr, get_node_name, get_parent_node, get_text_content,
    is_content_text,
};

/// id 锚点中需要转义的字符
const ID_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'%')
    .add(b'/')
    .add(b':')
    .add(b'[')
    .add(b']')
    .add(b'#')
    .add(b'@');

/// 位置描述符
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PositionDescriptor(String);

impl PositionDescriptor {
    /// 从原始字符串构造，不做校验；非法描述符在解析时得到 NotFound
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 解析为结构化形式
    pub fn parse(&self) -> Option<ParsedDescriptor> {
        ParsedDescriptor::parse(&self.0)
    }
}

impl fmt::Display for PositionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 文本单元类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    Content,
    Attribute,
}

/// 内容树中的一个可翻译位置
#[derive(Debug, Clone)]
pub enum Location {
    Text(Handle),
    Attribute { element: Handle, name: String },
}

impl Location {
    pub fn text(node: &Handle) -> Self {
        Location::Text(node.clone())
    }

    pub fn attribute(element: &Handle, name: &str) -> Self {
        Location::Attribute {
            element: element.clone(),
            name: name.to_string(),
        }
    }

    /// 承载该位置的节点
    pub fn node(&self) -> &Handle {
        match self {
            Location::Text(node) => node,
            Location::Attribute { element, .. } => element,
        }
    }

    pub fn attr_name(&self) -> Option<&str> {
        match self {
            Location::Text(_) => None,
            Location::Attribute { name, .. } => Some(name),
        }
    }

    pub fn kind(&self) -> UnitKind {
        match self {
            Location::Text(_) => UnitKind::Content,
            Location::Attribute { .. } => UnitKind::Attribute,
        }
    }

    /// 读取当前值（完整内容，不做裁剪）
    pub fn read(&self) -> Option<String> {
        match self {
            Location::Text(node) => get_text_content(node),
            Location::Attribute { element, name } => get_node_attr(element, name),
        }
    }
}

impl PartialEq for Location {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Location::Text(a), Location::Text(b)) => Rc::ptr_eq(a, b),
            (
                Location::Attribute { element: a, name: x },
                Location::Attribute { element: b, name: y },
            ) => Rc::ptr_eq(a, b) && x == y,
            _ => false,
        }
    }
}

impl Eq for Location {}

/// 提取时位置的弱引用
///
/// 描述符只能按当前树结构重新解析，兄弟节点插入后可能指向别的节点；
/// 这里记住的始终是提取时的那个节点。
#[derive(Debug, Clone, Default)]
pub struct LocationRef {
    node: Option<Weak<Node>>,
    attr: Option<String>,
}

impl LocationRef {
    pub fn new(location: &Location) -> Self {
        Self {
            node: Some(Rc::downgrade(location.node())),
            attr: location.attr_name().map(str::to_string),
        }
    }

    /// 是否记录过节点（反序列化得到的单元没有）
    pub fn is_set(&self) -> bool {
        self.node.is_some()
    }

    /// 节点仍存活时还原为位置
    pub fn upgrade(&self) -> Option<Location> {
        let node = self.node.as_ref()?.upgrade()?;
        Some(match &self.attr {
            Some(name) => Location::Attribute {
                element: node,
                name: name.clone(),
            },
            None => Location::Text(node),
        })
    }
}

impl PartialEq for LocationRef {
    fn eq(&self, other: &Self) -> bool {
        let same_node = match (&self.node, &other.node) {
            (Some(a), Some(b)) => Weak::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        same_node && self.attr == other.attr
    }
}

/// 解析结果
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Found(Location),
    NotFound,
}

impl Resolution {
    pub fn found(self) -> Option<Location> {
        match self {
            Resolution::Found(location) => Some(location),
            Resolution::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Resolution::Found(_))
    }
}

/// 描述符锚点
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anchor {
    Root,
    Id(String),
}

/// 描述符目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Text(usize),
    Attribute(String),
}

/// 结构化描述符
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDescriptor {
    pub anchor: Anchor,
    pub segments: Vec<(String, usize)>,
    pub target: Target,
}

impl ParsedDescriptor {
    fn parse(raw: &str) -> Option<Self> {
        let (path, target) = raw.split_once("::")?;

        let target = if let Some(name) = target.strip_prefix('@') {
            if name.is_empty() {
                return None;
            }
            Target::Attribute(name.to_string())
        } else {
            let ordinal = target.strip_prefix("text[")?.strip_suffix(']')?;
            Target::Text(ordinal.parse().ok()?)
        };

        let (anchor, rest) = if let Some(rest) = path.strip_prefix('/') {
            (Anchor::Root, rest)
        } else if let Some(rest) = path.strip_prefix('#') {
            let (encoded, rest) = rest.split_once('/').unwrap_or((rest, ""));
            let id = percent_decode_str(encoded).decode_utf8().ok()?;
            if id.is_empty() {
                return None;
            }
            (Anchor::Id(id.into_owned()), rest)
        } else {
            return None;
        };

        let mut segments = Vec::new();
        for segment in rest.split('/').filter(|s| !s.is_empty()) {
            let (tag, ordinal) = segment.strip_suffix(']')?.split_once('[')?;
            let ordinal: usize = ordinal.parse().ok()?;
            if tag.is_empty() || ordinal == 0 {
                return None;
            }
            segments.push((tag.to_string(), ordinal));
        }

        if anchor == Anchor::Root && segments.is_empty() {
            return None;
        }

        Some(Self {
            anchor,
            segments,
            target,
        })
    }
}

/// 文档内 id 出现次数的快照，一次提取过程中复用
#[derive(Debug, Default)]
pub struct IdIndex {
    counts: HashMap<String, usize>,
}

impl IdIndex {
    pub fn build(document: &Handle) -> Self {
        let mut counts = HashMap::new();
        let mut stack = vec![document.clone()];

        while let Some(node) = stack.pop() {
            if let Some(id) = get_node_attr(&node, "id") {
                if !id.is_empty() {
                    *counts.entry(id).or_insert(0) += 1;
                }
            }
            stack.extend(node.children.borrow().iter().cloned());
        }

        Self { counts }
    }

    pub fn is_unique(&self, id: &str) -> bool {
        self.counts.get(id) == Some(&1)
    }
}

/// 位置寻址器
#[derive(Debug, Clone)]
pub struct Addresser {
    document: Handle,
}

impl Addresser {
    pub fn new(document: Handle) -> Self {
        Self { document }
    }

    pub fn document(&self) -> &Handle {
        &self.document
    }

    /// 为位置生成描述符；位置已脱离文档或是空白文本时返回 None
    pub fn describe(&self, location: &Location) -> Option<PositionDescriptor> {
        let index = IdIndex::build(&self.document);
        self.describe_indexed(location, &index)
    }

    /// 使用预先构建的 id 索引生成描述符
    pub fn describe_indexed(
        &self,
        location: &Location,
        ids: &IdIndex,
    ) -> Option<PositionDescriptor> {
        let (element, target) = match location {
            Location::Text(node) => {
                if !is_content_text(node) {
                    return None;
                }
                let owner = get_parent_node(node)?;
                let ordinal = owner
                    .children
                    .borrow()
                    .iter()
                    .filter(|child| is_content_text(child))
                    .position(|child| Rc::ptr_eq(child, node))?;
                (owner, format!("text[{}]", ordinal))
            }
            Location::Attribute { element, name } => {
                get_node_attr(element, name)?;
                (element.clone(), format!("@{}", name))
            }
        };

        let path = self.element_path(&element, ids)?;
        Some(PositionDescriptor(format!("{}::{}", path, target)))
    }

    fn element_path(&self, element: &Handle, ids: &IdIndex) -> Option<String> {
        let mut segments: Vec<String> = Vec::new();
        let mut current = element.clone();

        let anchor = loop {
            match &current.data {
                NodeData::Document => {
                    if !Rc::ptr_eq(&current, &self.document) {
                        return None;
                    }
                    break String::new();
                }
                NodeData::Element { .. } => {
                    if let Some(id) = get_node_attr(&current, "id") {
                        if ids.is_unique(&id) {
                            break format!("#{}", utf8_percent_encode(&id, ID_ENCODE_SET));
                        }
                    }

                    let parent = get_parent_node(&current)?;
                    let tag = get_node_name(&current)?.to_string();
                    let ordinal = parent
                        .children
                        .borrow()
                        .iter()
                        .filter(|sibling| get_node_name(sibling) == Some(tag.as_str()))
                        .position(|sibling| Rc::ptr_eq(sibling, &current))?
                        + 1;
                    segments.push(format!("{}[{}]", tag, ordinal));
                    current = parent;
                }
                _ => return None,
            }
        };

        let mut path = anchor;
        for segment in segments.iter().rev() {
            path.push('/');
            path.push_str(segment);
        }
        Some(path)
    }

    /// 将描述符解析回位置；任何不匹配都返回 NotFound
    pub fn resolve(&self, descriptor: &PositionDescriptor) -> Resolution {
        match self.try_resolve(descriptor) {
            Some(location) => Resolution::Found(location),
            None => Resolution::NotFound,
        }
    }

    fn try_resolve(&self, descriptor: &PositionDescriptor) -> Option<Location> {
        let parsed = descriptor.parse()?;

        let mut current = match &parsed.anchor {
            Anchor::Root => self.document.clone(),
            Anchor::Id(id) => {
                let mut matches = find_elements_by_id(&self.document, id);
                if matches.len() != 1 {
                    return None;
                }
                matches.pop()?
            }
        };

        for (tag, ordinal) in &parsed.segments {
            let next = current
                .children
                .borrow()
                .iter()
                .filter(|child| get_node_name(child) == Some(tag.as_str()))
                .nth(ordinal - 1)
                .cloned()?;
            current = next;
        }

        match parsed.target {
            Target::Text(ordinal) => {
                let node = current
                    .children
                    .borrow()
                    .iter()
                    .filter(|child| is_content_text(child))
                    .nth(ordinal)
                    .cloned()?;
                Some(Location::Text(node))
            }
            Target::Attribute(name) => {
                get_node_attr(&current, &name)?;
                Some(Location::Attribute {
                    element: current,
                    name,
                })
            }
        }
    }
}
