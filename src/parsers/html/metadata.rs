//! HTML 文档元数据
//!
//! 命令行读取文档声明的字符集和标题；翻译完成后把 `<html lang>`
//! 改为目标语言。

use markup5ever_rcdom::{Handle, NodeData};

use super::dom::{find_nodes, get_node_attr, set_node_attr};

/// 获取文档声明的字符集
///
/// 支持 `<meta charset="...">` 和
/// `<meta http-equiv="content-type" content="text/html; charset=...">` 两种写法，
/// 只取第一个声明。
pub fn get_charset(node: &Handle) -> Option<String> {
    for meta_node in find_nodes(node, vec!["html", "head", "meta"]).iter() {
        if let Some(charset) = get_node_attr(meta_node, "charset") {
            return Some(charset.trim().to_string());
        }

        if get_node_attr(meta_node, "http-equiv")
            .unwrap_or_default()
            .eq_ignore_ascii_case("content-type")
        {
            if let Some(content) = get_node_attr(meta_node, "content") {
                return charset_from_content_type(&content);
            }
        }
    }

    None
}

fn charset_from_content_type(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("charset"))
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}

/// 获取文档标题（第一个 `<title>` 的文本）
pub fn get_title(node: &Handle) -> Option<String> {
    for title_node in find_nodes(node, vec!["html", "head", "title"]).iter() {
        for child_node in title_node.children.borrow().iter() {
            if let NodeData::Text { ref contents } = child_node.data {
                return Some(contents.borrow().trim().to_string());
            }
        }
    }

    None
}

/// 设置根元素的 `lang` 属性，返回是否找到 `<html>`
pub fn set_document_lang(document: &Handle, lang: &str) -> bool {
    match find_nodes(document, vec!["html"]).first() {
        Some(html) => {
            set_node_attr(html, "lang", Some(lang.to_string()));
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::html::dom::html_to_dom;

    #[test]
    fn test_charset_from_meta_charset() {
        let dom = html_to_dom(
            b"<html><head><meta charset=\"windows-1252\"></head><body></body></html>",
            "",
        );
        assert_eq!(get_charset(&dom.document), Some("windows-1252".to_string()));
    }

    #[test]
    fn test_charset_from_http_equiv() {
        let dom = html_to_dom(
            b"<html><head><meta http-equiv=\"Content-Type\" content=\"text/html; charset=EUC-KR\"></head></html>",
            "",
        );
        assert_eq!(get_charset(&dom.document), Some("EUC-KR".to_string()));
    }

    #[test]
    fn test_missing_charset() {
        let dom = html_to_dom(b"<html><head></head><body><p>x</p></body></html>", "");
        assert_eq!(get_charset(&dom.document), None);
    }

    #[test]
    fn test_title_and_lang() {
        let dom = html_to_dom(
            b"<html lang=\"en\"><head><title> Release notes </title></head><body></body></html>",
            "utf-8",
        );
        assert_eq!(get_title(&dom.document), Some("Release notes".to_string()));

        assert!(set_document_lang(&dom.document, "ko"));
        let html = find_nodes(&dom.document, vec!["html"]);
        assert_eq!(get_node_attr(&html[0], "lang"), Some("ko".to_string()));
    }
}
