//! HTML 解析和处理模块
//!
//! - `dom`: 解析与基础 DOM 操作
//! - `metadata`: 文档元数据
//! - `serializer`: 序列化

pub mod dom;
pub mod metadata;
pub mod serializer;

pub use dom::{
    find_nodes, get_node_attr, get_node_name, get_parent_node, html_to_dom, parse_fragment,
    set_node_attr,
};
pub use metadata::{get_charset, get_title, set_document_lang};
pub use serializer::serialize_document;
