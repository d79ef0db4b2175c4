//! 基础设施层
//!
//! 只提供与业务无关的底层能力（XML 元素树）

pub mod xml_doc;

pub use xml_doc::{XmlDocument, XmlElement, XmlNode};
