//! 文本单元状态登记
//!
//! 每个可翻译位置显式记录 `UnitState`，以节点身份加属性名为键。
//! 条目持有节点的 `Weak` 引用：节点被释放后条目可被 `prune` 清理，
//! 同时保证节点地址在条目存活期间不会被复用。

use std::collections::HashMap;
use std::rc::{Rc, Weak};

use markup5ever_rcdom::Node;
use serde::{Deserialize, Serialize};

use super::addressing::Location;

/// 单元状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitState {
    Untouched,
    Pending,
    Translated,
}

type UnitKey = (usize, Option<String>);

#[derive(Debug)]
struct UnitSlot {
    node: Weak<Node>,
    state: UnitState,
    original: Option<String>,
}

/// 状态计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryCounts {
    pub pending: usize,
    pub translated: usize,
}

/// 单元状态登记表
#[derive(Debug, Default)]
pub struct UnitRegistry {
    slots: HashMap<UnitKey, UnitSlot>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(location: &Location) -> UnitKey {
        (
            Rc::as_ptr(location.node()) as usize,
            location.attr_name().map(str::to_string),
        )
    }

    fn live_slot(&self, location: &Location) -> Option<&UnitSlot> {
        self.slots
            .get(&Self::key(location))
            .filter(|slot| slot.node.strong_count() > 0)
    }

    /// 当前状态，未登记的位置视为 untouched
    pub fn state(&self, location: &Location) -> UnitState {
        self.live_slot(location)
            .map(|slot| slot.state)
            .unwrap_or(UnitState::Untouched)
    }

    /// 标记为 pending；已是 pending 或 translated 时返回 false
    pub fn mark_pending(&mut self, location: &Location) -> bool {
        let slot = self
            .slots
            .entry(Self::key(location))
            .or_insert_with(|| UnitSlot {
                node: Rc::downgrade(location.node()),
                state: UnitState::Untouched,
                original: None,
            });

        if slot.state != UnitState::Untouched {
            return false;
        }
        slot.state = UnitState::Pending;
        true
    }

    /// 标记为 translated，首次翻译时保存原始值
    pub fn mark_translated(&mut self, location: &Location, original: String) {
        let slot = self
            .slots
            .entry(Self::key(location))
            .or_insert_with(|| UnitSlot {
                node: Rc::downgrade(location.node()),
                state: UnitState::Untouched,
                original: None,
            });

        slot.state = UnitState::Translated;
        if slot.original.is_none() {
            slot.original = Some(original);
        }
    }

    /// pending 单元回到 untouched；返回是否发生了变化
    pub fn release(&mut self, location: &Location) -> bool {
        let key = Self::key(location);
        match self.slots.get(&key).map(|slot| slot.state) {
            Some(UnitState::Pending) => {
                self.slots.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// 取出保存的原始值并清除状态
    pub fn take_original(&mut self, location: &Location) -> Option<String> {
        let key = Self::key(location);
        let slot = self.slots.get(&key)?;
        if slot.state != UnitState::Translated {
            return None;
        }
        self.slots.remove(&key).and_then(|slot| slot.original)
    }

    /// 所有仍存活的已翻译位置及其原始值
    pub fn translated_entries(&self) -> Vec<(Location, String)> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.state == UnitState::Translated)
            .filter_map(|((_, attr), slot)| {
                let node = slot.node.upgrade()?;
                let original = slot.original.clone()?;
                let location = match attr {
                    Some(name) => Location::Attribute {
                        element: node,
                        name: name.clone(),
                    },
                    None => Location::Text(node),
                };
                Some((location, original))
            })
            .collect()
    }

    /// 清理节点已释放的条目
    pub fn prune(&mut self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.node.strong_count() > 0);
        before - self.slots.len()
    }

    pub fn counts(&self) -> RegistryCounts {
        let mut counts = RegistryCounts::default();
        for slot in self.slots.values().filter(|s| s.node.strong_count() > 0) {
            match slot.state {
                UnitState::Pending => counts.pending += 1,
                UnitState::Translated => counts.translated += 1,
                UnitState::Untouched => {}
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
