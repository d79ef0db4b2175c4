//! XML 文档树 - 基础设施层
//!
//! 基于 quick-xml 事件流构建的轻量元素树。
//!
//! 元素的起始标签与文本节点保存原始字节（属性、命名空间声明、转义方式都不变），
//! 因此已签名的 `rDE` 在重新打包时可以原样写回。

use crate::error::XmlError;
use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;

/// XML 节点
#[derive(Debug, Clone)]
pub enum XmlNode {
    Element(XmlElement),
    Text(BytesText<'static>),
    CData(BytesCData<'static>),
    Comment(BytesText<'static>),
}

impl XmlNode {
    pub fn as_element(&self) -> Option<&XmlElement> {
        match self {
            XmlNode::Element(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_element_mut(&mut self) -> Option<&mut XmlElement> {
        match self {
            XmlNode::Element(e) => Some(e),
            _ => None,
        }
    }
}

/// XML 元素
#[derive(Debug, Clone)]
pub struct XmlElement {
    start: BytesStart<'static>,
    pub children: Vec<XmlNode>,
    self_closing: bool,
}

impl XmlElement {
    /// 创建新元素（`name` 可以带前缀）
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            start: BytesStart::new(name.into()),
            children: Vec::new(),
            self_closing: false,
        }
    }

    /// 创建只包含文本的元素
    pub fn with_text(name: impl Into<String>, text: impl AsRef<str>) -> Self {
        let mut element = Self::new(name);
        element.set_text(text.as_ref());
        element
    }

    /// 添加属性（builder 风格）
    pub fn attr(mut self, key: &str, value: &str) -> Self {
        self.start.push_attribute((key, value));
        self
    }

    /// 添加子元素（builder 风格）
    pub fn child(mut self, child: XmlElement) -> Self {
        self.push(child);
        self
    }

    /// 添加子元素
    pub fn push(&mut self, child: XmlElement) {
        self.children.push(XmlNode::Element(child));
    }

    /// 完整标签名（含前缀）
    pub fn name(&self) -> &str {
        std::str::from_utf8(self.start.name().into_inner()).unwrap_or_default()
    }

    /// 本地名（不含前缀）
    pub fn local_name(&self) -> &str {
        std::str::from_utf8(self.start.local_name().into_inner()).unwrap_or_default()
    }

    /// 命名空间前缀
    pub fn prefix(&self) -> Option<&str> {
        self.start
            .name()
            .prefix()
            .and_then(|p| std::str::from_utf8(p.into_inner()).ok())
    }

    /// 与本元素同前缀的新标签名
    pub fn sibling_name(&self, local: &str) -> String {
        match self.prefix() {
            Some(prefix) => format!("{}:{}", prefix, local),
            None => local.to_string(),
        }
    }

    /// 读取属性值
    pub fn get_attr(&self, key: &str) -> Option<String> {
        self.start
            .attributes()
            .flatten()
            .find(|a| a.key.as_ref() == key.as_bytes())
            .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
    }

    /// 元素内直接文本（拼接所有文本节点并去除首尾空白）
    pub fn text(&self) -> String {
        let mut out = String::new();
        for node in &self.children {
            match node {
                XmlNode::Text(t) => {
                    if let Ok(s) = t.unescape() {
                        out.push_str(&s);
                    }
                }
                XmlNode::CData(c) => {
                    out.push_str(&String::from_utf8_lossy(&c[..]));
                }
                _ => {}
            }
        }
        out.trim().to_string()
    }

    /// 用单个文本节点替换所有子节点
    pub fn set_text(&mut self, text: &str) {
        self.children = vec![XmlNode::Text(BytesText::new(text).into_owned())];
        self.self_closing = false;
    }

    /// 子元素迭代
    pub fn elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(XmlNode::as_element)
    }

    pub fn elements_mut(&mut self) -> impl Iterator<Item = &mut XmlElement> {
        self.children.iter_mut().filter_map(XmlNode::as_element_mut)
    }

    /// 按本地名查找直接子元素
    pub fn child_by_name(&self, local: &str) -> Option<&XmlElement> {
        self.elements().find(|e| e.local_name() == local)
    }

    pub fn child_by_name_mut(&mut self, local: &str) -> Option<&mut XmlElement> {
        self.elements_mut().find(|e| e.local_name() == local)
    }

    /// 是否存在指定本地名的直接子元素
    pub fn has_child(&self, local: &str) -> bool {
        self.child_by_name(local).is_some()
    }

    /// 子元素本地名列表（按文档顺序）
    pub fn child_names(&self) -> Vec<String> {
        self.elements().map(|e| e.local_name().to_string()).collect()
    }

    /// 直接子元素文本
    pub fn child_text(&self, local: &str) -> Option<String> {
        self.child_by_name(local).map(XmlElement::text)
    }

    /// 深度优先查找第一个指定本地名的后代（含自身）
    pub fn find(&self, local: &str) -> Option<&XmlElement> {
        if self.local_name() == local {
            return Some(self);
        }
        self.elements().find_map(|e| e.find(local))
    }

    pub fn find_mut(&mut self, local: &str) -> Option<&mut XmlElement> {
        if self.local_name() == local {
            return Some(self);
        }
        self.elements_mut().find_map(|e| e.find_mut(local))
    }

    /// 收集所有指定本地名的后代（含自身）
    pub fn find_all<'a>(&'a self, local: &str, out: &mut Vec<&'a XmlElement>) {
        if self.local_name() == local {
            out.push(self);
        }
        for e in self.elements() {
            e.find_all(local, out);
        }
    }

    /// 子元素在 `children` 中的下标
    pub fn position_of(&self, local: &str) -> Option<usize> {
        self.children
            .iter()
            .position(|n| n.as_element().is_some_and(|e| e.local_name() == local))
    }

    /// 删除所有指定本地名的直接子元素，返回删除数量
    pub fn remove_children(&mut self, local: &str) -> usize {
        let before = self.children.len();
        self.children
            .retain(|n| n.as_element().map_or(true, |e| e.local_name() != local));
        before - self.children.len()
    }

    /// 在指定本地名的子元素之后插入；找不到时追加到末尾
    pub fn insert_after(&mut self, anchor: &str, element: XmlElement) {
        match self.position_of(anchor) {
            Some(idx) => self.children.insert(idx + 1, XmlNode::Element(element)),
            None => self.push(element),
        }
    }

    fn write_to(&self, writer: &mut Writer<Vec<u8>>) -> Result<(), XmlError> {
        if self.children.is_empty() && self.self_closing {
            writer.write_event(Event::Empty(self.start.clone()))?;
            return Ok(());
        }
        writer.write_event(Event::Start(self.start.clone()))?;
        for node in &self.children {
            match node {
                XmlNode::Element(e) => e.write_to(writer)?,
                XmlNode::Text(t) => writer.write_event(Event::Text(t.clone()))?,
                XmlNode::CData(c) => writer.write_event(Event::CData(c.clone()))?,
                XmlNode::Comment(c) => writer.write_event(Event::Comment(c.clone()))?,
            }
        }
        writer.write_event(Event::End(BytesEnd::new(self.name().to_string())))?;
        Ok(())
    }

    /// 序列化为字符串（不含 XML 声明）
    pub fn to_xml_string(&self) -> Result<String, XmlError> {
        let mut writer = Writer::new(Vec::new());
        self.write_to(&mut writer)?;
        Ok(String::from_utf8(writer.into_inner())?)
    }
}

/// XML 文档
#[derive(Debug, Clone)]
pub struct XmlDocument {
    decl: Option<BytesDecl<'static>>,
    pub root: XmlElement,
}

impl XmlDocument {
    /// 以指定根元素创建文档（带 UTF-8 声明）
    pub fn new(root: XmlElement) -> Self {
        Self {
            decl: Some(BytesDecl::new("1.0", Some("UTF-8"), None)),
            root,
        }
    }

    /// 解析 XML 文本
    pub fn parse(xml: &str) -> Result<Self, XmlError> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(false);

        let mut decl = None;
        let mut stack: Vec<XmlElement> = Vec::new();
        let mut root: Option<XmlElement> = None;

        loop {
            match reader.read_event()? {
                Event::Decl(d) => decl = Some(d.into_owned()),
                Event::Start(start) => stack.push(XmlElement {
                    start: start.into_owned(),
                    children: Vec::new(),
                    self_closing: false,
                }),
                Event::Empty(start) => {
                    let element = XmlElement {
                        start: start.into_owned(),
                        children: Vec::new(),
                        self_closing: true,
                    };
                    attach(&mut stack, &mut root, element)?;
                }
                Event::End(end) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| XmlError::Malformed("多余的结束标签".to_string()))?;
                    if element.start.name().as_ref() != end.name().as_ref() {
                        return Err(XmlError::Malformed(format!(
                            "结束标签 </{}> 与 <{}> 不匹配",
                            String::from_utf8_lossy(end.name().as_ref()),
                            element.name()
                        )));
                    }
                    attach(&mut stack, &mut root, element)?;
                }
                Event::Text(t) => {
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(XmlNode::Text(t.into_owned()));
                    }
                }
                Event::CData(c) => {
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(XmlNode::CData(c.into_owned()));
                    }
                }
                Event::Comment(c) => {
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(XmlNode::Comment(c.into_owned()));
                    }
                }
                Event::PI(_) | Event::DocType(_) => {}
                Event::Eof => break,
            }
        }

        if !stack.is_empty() {
            return Err(XmlError::Malformed(format!(
                "元素 <{}> 未闭合",
                stack.last().map(XmlElement::name).unwrap_or_default()
            )));
        }
        let root = root.ok_or_else(|| XmlError::Malformed("缺少根元素".to_string()))?;
        Ok(Self { decl, root })
    }

    /// 序列化为字符串（保留原有声明）
    pub fn to_xml_string(&self) -> Result<String, XmlError> {
        let mut writer = Writer::new(Vec::new());
        if let Some(decl) = &self.decl {
            writer.write_event(Event::Decl(decl.clone()))?;
        }
        self.root.write_to(&mut writer)?;
        Ok(String::from_utf8(writer.into_inner())?)
    }
}

fn attach(
    stack: &mut [XmlElement],
    root: &mut Option<XmlElement>,
    element: XmlElement,
) -> Result<(), XmlError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(XmlNode::Element(element));
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(element);
            Ok(())
        }
        None => Err(XmlError::Malformed("存在多个根元素".to_string())),
    }
}
