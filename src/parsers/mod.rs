//! # 解析器模块
//!
//! HTML 文档解析、DOM 操作和序列化。

pub mod html;

pub use html::{html_to_dom, serialize_document};
