//! 0160 结构补丁 - 业务能力层
//!
//! 处理 "El elemento esperado es: A en lugar de: B" 类拒绝：
//! 1. 在同一父元素下、`B` 之前插入 `A`（父元素已有 `A` 时不插入）
//! 2. 把合计字段组按配置的规范顺序重排，缺失字段补默认值
//!
//! 补丁只增加或移动元素，从不删除，也不会产生重复元素。

use crate::config::PatchConfig;
use crate::error::{AppResult, PatchError};
use crate::infrastructure::{XmlDocument, XmlElement, XmlNode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const DISCREPANCY_PATTERN: &str = r"(?i)elemento\s+esperado\s+es\s*:\s*([A-Za-z_][\w:-]*)[^A-Za-z_]*?en\s+lugar\s+de\s*:\s*([A-Za-z_][\w:-]*)";

/// 从 0160 消息中解析出的元素差异
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discrepancy {
    /// 期望出现的元素（本地名）
    pub expected: String,
    /// 实际出现的元素（本地名）
    pub found: String,
}

impl Discrepancy {
    /// 解析 0160 消息，无法识别时返回 `None`
    pub fn parse(message: &str) -> Option<Self> {
        let Ok(re) = Regex::new(DISCREPANCY_PATTERN) else {
            return None;
        };
        let caps = re.captures(message)?;
        Some(Self {
            expected: local_part(&caps[1]).to_string(),
            found: local_part(&caps[2]).to_string(),
        })
    }
}

fn local_part(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

/// 补丁结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchReport {
    /// 插入的 `expected` 元素数量
    pub inserted: usize,
    /// 重排过的合计字段组数量
    pub reordered_groups: usize,
    /// 补齐的合计字段
    pub filled: Vec<String>,
}

impl PatchReport {
    pub fn changed(&self) -> bool {
        self.inserted > 0 || self.reordered_groups > 0 || !self.filled.is_empty()
    }
}

/// XML 补丁器
pub struct XmlPatcher<'a> {
    config: &'a PatchConfig,
}

impl<'a> XmlPatcher<'a> {
    pub fn new(config: &'a PatchConfig) -> Self {
        Self { config }
    }

    /// 对 XML 文本打补丁，返回新文本与补丁结果
    pub fn patch_xml(
        &self,
        xml: &str,
        discrepancy: &Discrepancy,
    ) -> AppResult<(String, PatchReport)> {
        let mut doc = XmlDocument::parse(xml)?;
        let report = self.apply(&mut doc.root, discrepancy)?;
        Ok((doc.to_xml_string()?, report))
    }

    /// 插入 + 重排
    ///
    /// 文档已经符合要求时返回未变化的报告（[`PatchReport::changed`] 为 false），
    /// 找不到 `found` 元素时返回 [`PatchError::AnchorNotFound`]
    pub fn apply(
        &self,
        root: &mut XmlElement,
        discrepancy: &Discrepancy,
    ) -> Result<PatchReport, PatchError> {
        let inserted = self.insert_expected(root, discrepancy)?;
        let mut report = PatchReport {
            inserted,
            ..Default::default()
        };
        self.reorder_totals(root, &mut report);

        if report.changed() {
            info!(
                "🔧 补丁完成: 插入 {} 个 <{}>，重排 {} 组合计字段，补齐 {:?}",
                report.inserted, discrepancy.expected, report.reordered_groups, report.filled
            );
        } else {
            warn!(
                "⚠️ 补丁未产生变化: <{}> 已位于 <{}> 之前",
                discrepancy.expected, discrepancy.found
            );
        }
        Ok(report)
    }

    /// 在每个包含 `found` 而不包含 `expected` 的父元素中插入 `expected`
    ///
    /// 幂等：父元素已有 `expected` 时不做任何修改
    pub fn insert_expected(
        &self,
        root: &mut XmlElement,
        discrepancy: &Discrepancy,
    ) -> Result<usize, PatchError> {
        let mut anchor_seen = false;
        let inserted = insert_before(
            root,
            discrepancy,
            &self.config.default_value,
            &mut anchor_seen,
        );
        if !anchor_seen {
            return Err(PatchError::AnchorNotFound {
                element: discrepancy.found.clone(),
            });
        }
        Ok(inserted)
    }

    /// 按规范顺序重排所有合计字段组
    pub fn reorder_totals(&self, root: &mut XmlElement, report: &mut PatchReport) {
        visit_groups(root, &self.config.totals_parent, &mut |group| {
            if let Some(filled) = reorder_group(group, self.config) {
                report.reordered_groups += 1;
                report.filled.extend(filled);
            }
        });
    }
}

fn insert_before(
    element: &mut XmlElement,
    discrepancy: &Discrepancy,
    value: &str,
    anchor_seen: &mut bool,
) -> usize {
    let mut inserted = 0;

    if let Some(idx) = element.position_of(&discrepancy.found) {
        *anchor_seen = true;
        if !element.has_child(&discrepancy.expected) {
            let name = element.children[idx]
                .as_element()
                .map(|anchor| anchor.sibling_name(&discrepancy.expected))
                .unwrap_or_else(|| discrepancy.expected.clone());
            debug!("在 <{}> 中插入 <{}>", element.local_name(), name);
            // 锚点前是缩进时，新元素沿用同样的缩进
            let indent = idx
                .checked_sub(1)
                .map(|prev| &element.children[prev])
                .filter(|node| is_whitespace(node))
                .cloned();
            element
                .children
                .insert(idx, XmlNode::Element(XmlElement::with_text(name, value)));
            if let Some(indent) = indent {
                element.children.insert(idx + 1, indent);
            }
            inserted += 1;
        }
    }

    for child in element.elements_mut() {
        inserted += insert_before(child, discrepancy, value, anchor_seen);
    }
    inserted
}

fn visit_groups(element: &mut XmlElement, parent: &str, f: &mut dyn FnMut(&mut XmlElement)) {
    if element.local_name() == parent {
        f(element);
        return;
    }
    for child in element.elements_mut() {
        visit_groups(child, parent, f);
    }
}

fn is_whitespace(node: &XmlNode) -> bool {
    matches!(node, XmlNode::Text(t) if t.iter().all(u8::is_ascii_whitespace))
}

/// 重排一个合计字段组，有变化时返回补齐的字段名
///
/// 已知字段按规范顺序排列；未知字段紧跟在它原来后面的第一个已知字段之前，
/// 其后没有已知字段时留在末尾。缩进空白按原样放回每个元素之前。
fn reorder_group(group: &mut XmlElement, config: &PatchConfig) -> Option<Vec<String>> {
    let before = group.child_names();
    let original = group.children.clone();
    let rank_of = |e: &XmlElement| config.totals_order.iter().position(|n| n == e.local_name());

    let mut elements: Vec<XmlElement> = Vec::new();
    let mut others: Vec<XmlNode> = Vec::new();
    let mut indent: Option<XmlNode> = None;
    let mut pending: Option<XmlNode> = None;

    for node in std::mem::take(&mut group.children) {
        match node {
            XmlNode::Element(e) => {
                if indent.is_none() {
                    indent = pending.take();
                }
                pending = None;
                elements.push(e);
            }
            ws if is_whitespace(&ws) => pending = Some(ws),
            other => others.push(other),
        }
    }
    let trailing = pending;

    // (规范位置, 0 = 未知字段 / 1 = 已知字段)
    let mut keyed: Vec<((usize, u8), XmlElement)> = Vec::with_capacity(elements.len());
    let mut next_rank = usize::MAX;
    for e in elements.into_iter().rev() {
        let key = match rank_of(&e) {
            Some(rank) => {
                next_rank = rank;
                (rank, 1)
            }
            None => (next_rank, 0),
        };
        keyed.push((key, e));
    }
    keyed.reverse();

    let mut filled = Vec::new();
    for name in &config.totals_fill {
        let Some(rank) = config.totals_order.iter().position(|n| n == name) else {
            continue;
        };
        if keyed.iter().any(|(key, _)| *key == (rank, 1)) {
            continue;
        }
        let qualified = keyed
            .first()
            .map(|(_, e)| e.sibling_name(name))
            .unwrap_or_else(|| group.sibling_name(name));
        keyed.push(((rank, 1), XmlElement::with_text(qualified, &config.default_value)));
        filled.push(name.clone());
    }

    // 稳定排序，同名重复元素与相邻的未知字段保持原有先后
    keyed.sort_by_key(|(key, _)| *key);

    let mut children = Vec::with_capacity(keyed.len() * 2 + 1);
    for (_, e) in keyed {
        if let Some(indent) = &indent {
            children.push(indent.clone());
        }
        children.push(XmlNode::Element(e));
    }
    children.extend(trailing);
    children.extend(others);
    group.children = children;

    if group.child_names() == before {
        group.children = original;
        return None;
    }
    debug!("重排 <{}>: {:?}", group.local_name(), group.child_names());
    Some(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn config() -> PatchConfig {
        PatchConfig {
            default_value: "0".to_string(),
            totals_parent: "gTotSub".to_string(),
            totals_order: ["dSubExe", "dSubExo", "dSub5", "dSub10", "dTotOpe", "dTotGralOpe"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            totals_fill: ["dSubExe", "dSubExo", "dSub5", "dSub10", "dTotOpe"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    fn discrepancy(expected: &str, found: &str) -> Discrepancy {
        Discrepancy {
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    const TOTALS: &str = r#"<rDE xmlns="http://ekuatia.set.gov.py/sifen/xsd"><DE Id="1"><gTotSub><dSubExo>0</dSubExo><dSub5>0</dSub5><dSub10>110000</dSub10><dTotOpe>110000</dTotOpe><dTotGralOpe>110000</dTotGralOpe></gTotSub></DE></rDE>"#;

    #[test]
    fn test_parse_discrepancy_message() {
        let d = Discrepancy::parse(
            "XML malformado: [El elemento esperado es: dSubExe en lugar de: dSubExo]",
        )
        .unwrap();
        assert_eq!(d, discrepancy("dSubExe", "dSubExo"));

        let d = Discrepancy::parse("ELEMENTO ESPERADO ES: ns2:gCamCond, EN LUGAR DE: ns2:gCamItem.")
            .unwrap();
        assert_eq!(d, discrepancy("gCamCond", "gCamItem"));

        assert!(Discrepancy::parse("XML malformado: firma inválida").is_none());
    }

    #[test]
    fn test_dsubexe_inserted_before_dsubexo() {
        let cfg = config();
        let mut doc = XmlDocument::parse(TOTALS).unwrap();
        let report = XmlPatcher::new(&cfg)
            .apply(&mut doc.root, &discrepancy("dSubExe", "dSubExo"))
            .unwrap();
        assert_eq!(report.inserted, 1);

        let totals = doc.root.find("gTotSub").unwrap();
        assert_eq!(
            totals.child_names(),
            vec!["dSubExe", "dSubExo", "dSub5", "dSub10", "dTotOpe", "dTotGralOpe"]
        );
        assert_eq!(totals.child_text("dSubExe").as_deref(), Some("0"));
        assert_eq!(totals.child_text("dSub10").as_deref(), Some("110000"));
    }

    #[test]
    fn test_insert_is_idempotent() {
        let cfg = config();
        let patcher = XmlPatcher::new(&cfg);
        let d = discrepancy("dSubExe", "dSubExo");
        let mut doc = XmlDocument::parse(TOTALS).unwrap();

        assert_eq!(patcher.insert_expected(&mut doc.root, &d).unwrap(), 1);
        let once = doc.to_xml_string().unwrap();
        assert_eq!(patcher.insert_expected(&mut doc.root, &d).unwrap(), 0);
        assert_eq!(doc.to_xml_string().unwrap(), once);
    }

    #[test]
    fn test_repeated_patch_is_noop() {
        let cfg = config();
        let patcher = XmlPatcher::new(&cfg);
        let d = discrepancy("dSubExe", "dSubExo");

        let (once, first) = patcher.patch_xml(TOTALS, &d).unwrap();
        assert!(first.changed());

        let (twice, second) = patcher.patch_xml(&once, &d).unwrap();
        assert!(!second.changed());
        assert_eq!(second, PatchReport::default());
        assert_eq!(twice, once);
    }

    #[test]
    fn test_children_are_superset_after_patch() {
        let cfg = config();
        let xml = r#"<rDE><DE Id="1"><gTotSub><dTotGralOpe>5</dTotGralOpe><dExtra>x</dExtra><dSub10>5</dSub10><dSub10>6</dSub10></gTotSub></DE></rDE>"#;
        let mut doc = XmlDocument::parse(xml).unwrap();
        let before: Vec<String> = doc.root.find("gTotSub").unwrap().child_names();

        XmlPatcher::new(&cfg)
            .apply(&mut doc.root, &discrepancy("dSub5", "dSub10"))
            .unwrap();

        let after = doc.root.find("gTotSub").unwrap().child_names();
        let after_set: HashSet<&String> = after.iter().collect();
        assert!(before.iter().all(|n| after_set.contains(n)));
        // 原有重复元素保留，新增元素不重复
        assert_eq!(after.iter().filter(|n| *n == "dSub10").count(), 2);
        assert_eq!(after.iter().filter(|n| *n == "dSub5").count(), 1);
        // 未知字段跟随它后面的已知字段移动
        let extra = after.iter().position(|n| n == "dExtra").unwrap();
        assert_eq!(after[extra + 1], "dSub5");
    }

    #[test]
    fn test_unknown_expected_stays_before_anchor_after_reorder() {
        let cfg = config();
        let mut doc = XmlDocument::parse(TOTALS).unwrap();
        let report = XmlPatcher::new(&cfg)
            .apply(&mut doc.root, &discrepancy("dTotOpeGs", "dTotGralOpe"))
            .unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.filled, vec!["dSubExe"]);
        assert_eq!(
            doc.root.find("gTotSub").unwrap().child_names(),
            vec!["dSubExe", "dSubExo", "dSub5", "dSub10", "dTotOpe", "dTotOpeGs", "dTotGralOpe"]
        );
    }

    #[test]
    fn test_unknown_expected_with_default_order() {
        let cfg = PatchConfig::default();
        let mut doc = XmlDocument::parse(TOTALS).unwrap();
        XmlPatcher::new(&cfg)
            .apply(&mut doc.root, &discrepancy("dTotOpeGs", "dTotGralOpe"))
            .unwrap();

        let names = doc.root.find("gTotSub").unwrap().child_names();
        let inserted = names.iter().position(|n| n == "dTotOpeGs").unwrap();
        assert_eq!(names[inserted + 1], "dTotGralOpe");
    }

    #[test]
    fn test_reorder_keeps_indentation() {
        let cfg = config();
        let xml = "<rDE><gTotSub>\n    <dSubExo>0</dSubExo>\n    <dTotGralOpe>1</dTotGralOpe>\n  </gTotSub></rDE>";
        let (patched, report) = XmlPatcher::new(&cfg)
            .patch_xml(xml, &discrepancy("dSubExe", "dSubExo"))
            .unwrap();
        assert_eq!(report.reordered_groups, 1);
        assert!(patched.contains(
            "<gTotSub>\n    <dSubExe>0</dSubExe>\n    <dSubExo>0</dSubExo>\n    <dSub5>0</dSub5>\n    <dSub10>0</dSub10>\n    <dTotOpe>0</dTotOpe>\n    <dTotGralOpe>1</dTotGralOpe>\n  </gTotSub>"
        ));
    }

    #[test]
    fn test_insert_copies_anchor_indentation() {
        let cfg = config();
        let xml = "<rDE><gCamItem>\n  <dDesProSer>A</dDesProSer>\n</gCamItem></rDE>";
        let (patched, _) = XmlPatcher::new(&cfg)
            .patch_xml(xml, &discrepancy("dCodInt", "dDesProSer"))
            .unwrap();
        assert!(patched.contains(
            "<gCamItem>\n  <dCodInt>0</dCodInt>\n  <dDesProSer>A</dDesProSer>\n</gCamItem>"
        ));
    }

    #[test]
    fn test_prefix_and_namespace_preserved() {
        let cfg = config();
        let xml = r#"<ns2:rDE xmlns:ns2="http://ekuatia.set.gov.py/sifen/xsd"><ns2:gCamItem><ns2:dDesProSer>A</ns2:dDesProSer></ns2:gCamItem></ns2:rDE>"#;
        let mut doc = XmlDocument::parse(xml).unwrap();
        XmlPatcher::new(&cfg)
            .apply(&mut doc.root, &discrepancy("dCodInt", "dDesProSer"))
            .unwrap();
        let out = doc.to_xml_string().unwrap();
        assert!(out.starts_with(r#"<ns2:rDE xmlns:ns2="http://ekuatia.set.gov.py/sifen/xsd">"#));
        assert!(out.contains("<ns2:dCodInt>0</ns2:dCodInt><ns2:dDesProSer>A</ns2:dDesProSer>"));
    }

    #[test]
    fn test_missing_anchor_is_error() {
        let cfg = config();
        let mut doc = XmlDocument::parse(TOTALS).unwrap();
        let err = XmlPatcher::new(&cfg)
            .apply(&mut doc.root, &discrepancy("dFoo", "dBar"))
            .unwrap_err();
        assert!(matches!(err, PatchError::AnchorNotFound { .. }));
    }

    #[test]
    fn test_reorder_fills_missing_totals() {
        let cfg = config();
        let xml = r#"<rDE><gTotSub><dTotGralOpe>1</dTotGralOpe><dSub10>1</dSub10></gTotSub></rDE>"#;
        let mut doc = XmlDocument::parse(xml).unwrap();
        let mut report = PatchReport::default();
        XmlPatcher::new(&cfg).reorder_totals(&mut doc.root, &mut report);

        assert_eq!(report.reordered_groups, 1);
        assert_eq!(report.filled, vec!["dSubExe", "dSubExo", "dSub5", "dTotOpe"]);
        assert_eq!(
            doc.root.find("gTotSub").unwrap().child_names(),
            vec!["dSubExe", "dSubExo", "dSub5", "dSub10", "dTotOpe", "dTotGralOpe"]
        );
    }
}
