//! 签名服务 - 业务能力层
//!
//! 只负责"签名 + 二维码"能力。XMLDSig 由 `xmlsec1` 完成，这里只负责
//! 插入签名模板、调用工具、回填 `gCamFuFD`。

use crate::config::Config;
use crate::error::{SigningError, XmlError};
use crate::infrastructure::{XmlDocument, XmlElement, XmlNode};
use crate::services::qr::QrBuilder;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

const DSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";

/// 文档签名能力
#[async_trait]
pub trait DocumentSigner: Send + Sync {
    /// 对 XML（`rDE` 或 `rLoteDE`）中的每个 `rDE` 签名，返回签名后的 XML
    async fn sign(&self, xml: &str) -> Result<String, SigningError>;
}

/// 基于 xmlsec1 的签名器
pub struct XmlsecSigner {
    program: String,
    cert_path: PathBuf,
    key_path: PathBuf,
    qr_base_url: String,
    csc_id: String,
    csc_secret: String,
}

impl XmlsecSigner {
    /// 创建签名器
    pub fn new(config: &Config) -> Self {
        Self {
            program: config.signer.xmlsec_bin.clone(),
            cert_path: config.tls.cert_path.clone(),
            key_path: config.tls.key_path.clone(),
            qr_base_url: config.qr_base_url().to_string(),
            csc_id: config.csc.id.clone(),
            csc_secret: config.csc.secret.clone(),
        }
    }

    /// 调用 xmlsec1 的参数
    ///
    /// xmlsec1 只在名称与命名空间都匹配的节点上登记 Id 属性，
    /// 带命名空间的 `DE` 必须写成 `<namespace>:DE`
    fn xmlsec_args(&self, id_node: &str, input: &Path, output: &Path) -> Vec<OsString> {
        let key_spec = format!("{},{}", self.key_path.display(), self.cert_path.display());
        vec![
            "--sign".into(),
            "--privkey-pem".into(),
            key_spec.into(),
            "--id-attr:Id".into(),
            id_node.into(),
            "--output".into(),
            output.as_os_str().to_os_string(),
            input.as_os_str().to_os_string(),
        ]
    }

    async fn sign_rde(
        &self,
        rde: &XmlElement,
        inherited_ns: Option<&str>,
    ) -> Result<XmlElement, SigningError> {
        let mut rde = with_namespace(rde.clone(), inherited_ns);
        prepare_template(&mut rde)?;
        let id_node = id_attr_node(&rde);

        let dir = tempfile::tempdir()?;
        let input = dir.path().join("unsigned.xml");
        let output = dir.path().join("signed.xml");
        let template = XmlDocument::new(rde).to_xml_string()?;
        tokio::fs::write(&input, template).await?;

        debug!("调用 {} 签名: {} (Id 节点 {})", self.program, input.display(), id_node);

        let result = Command::new(&self.program)
            .args(self.xmlsec_args(&id_node, &input, &output))
            .output()
            .await
            .map_err(|source| SigningError::SpawnFailed {
                program: self.program.clone(),
                source,
            })?;

        if !result.status.success() {
            return Err(SigningError::ToolFailed {
                program: self.program.clone(),
                status: result.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }

        let signed = tokio::fs::read_to_string(&output).await?;
        let mut signed = XmlDocument::parse(&signed)?.root;

        let qr = QrBuilder::new(&self.qr_base_url, &self.csc_id, &self.csc_secret).build(&signed)?;
        attach_qr(&mut signed, &qr);
        Ok(signed)
    }
}

#[async_trait]
impl DocumentSigner for XmlsecSigner {
    async fn sign(&self, xml: &str) -> Result<String, SigningError> {
        let mut doc = XmlDocument::parse(xml)?;

        if doc.root.local_name() == "rDE" {
            doc.root = self.sign_rde(&doc.root, None).await?;
        } else {
            let lot_ns = doc.root.get_attr("xmlns");
            let mut signed_count = 0;
            for node in doc.root.children.iter_mut() {
                if let XmlNode::Element(child) = node {
                    if child.local_name() == "rDE" {
                        *child = self.sign_rde(child, lot_ns.as_deref()).await?;
                        signed_count += 1;
                    }
                }
            }
            if signed_count == 0 {
                return Err(SigningError::MissingElement("rDE".to_string()));
            }
        }

        info!("✓ 签名完成");
        Ok(doc.to_xml_string()?)
    }
}

/// 文档中是否已有签名
pub fn is_signed(rde: &XmlElement) -> bool {
    rde.find("Signature").is_some()
}

/// XML 中的每个 `rDE` 是否都已签名
pub fn is_fully_signed(xml: &str) -> Result<bool, XmlError> {
    let doc = XmlDocument::parse(xml)?;
    let mut documents = Vec::new();
    doc.root.find_all("rDE", &mut documents);
    Ok(!documents.is_empty() && documents.iter().all(|rde| is_signed(rde)))
}

/// 单独签名的 `rDE` 没有默认命名空间时，带上外层 `rLoteDE` 的命名空间
fn with_namespace(rde: XmlElement, inherited_ns: Option<&str>) -> XmlElement {
    match inherited_ns {
        Some(ns) if rde.prefix().is_none() && rde.get_attr("xmlns").is_none() => {
            rde.attr("xmlns", ns)
        }
        _ => rde,
    }
}

/// `DE` 元素的命名空间（在 `DE` 或 `rDE` 上声明）
fn de_namespace(rde: &XmlElement) -> Option<String> {
    let de = rde.child_by_name("DE")?;
    let key = de
        .prefix()
        .map(|prefix| format!("xmlns:{}", prefix))
        .unwrap_or_else(|| "xmlns".to_string());
    de.get_attr(&key)
        .or_else(|| rde.get_attr(&key))
        .filter(|ns| !ns.is_empty())
}

/// 传给 `--id-attr:Id` 的节点名
pub fn id_attr_node(rde: &XmlElement) -> String {
    match de_namespace(rde) {
        Some(ns) => format!("{}:DE", ns),
        None => "DE".to_string(),
    }
}

/// 删除旧签名与二维码，在 `DE` 之后插入签名模板
pub fn prepare_template(rde: &mut XmlElement) -> Result<(), SigningError> {
    let cdc = rde
        .child_by_name("DE")
        .and_then(|de| de.get_attr("Id"))
        .ok_or_else(|| SigningError::MissingElement("DE/@Id".to_string()))?;

    rde.remove_children("Signature");
    rde.remove_children("gCamFuFD");
    rde.insert_after("DE", signature_template(&cdc));
    Ok(())
}

fn signature_template(cdc: &str) -> XmlElement {
    let reference = XmlElement::new("Reference")
        .attr("URI", &format!("#{}", cdc))
        .child(
            XmlElement::new("Transforms")
                .child(
                    XmlElement::new("Transform")
                        .attr("Algorithm", "http://www.w3.org/2000/09/xmldsig#enveloped-signature"),
                )
                .child(
                    XmlElement::new("Transform")
                        .attr("Algorithm", "http://www.w3.org/2001/10/xml-exc-c14n#"),
                ),
        )
        .child(
            XmlElement::new("DigestMethod")
                .attr("Algorithm", "http://www.w3.org/2001/04/xmlenc#sha256"),
        )
        .child(XmlElement::new("DigestValue"));

    XmlElement::new("Signature")
        .attr("xmlns", DSIG_NS)
        .child(
            XmlElement::new("SignedInfo")
                .child(
                    XmlElement::new("CanonicalizationMethod")
                        .attr("Algorithm", "http://www.w3.org/TR/2001/REC-xml-c14n-20010315"),
                )
                .child(
                    XmlElement::new("SignatureMethod")
                        .attr("Algorithm", "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256"),
                )
                .child(reference),
        )
        .child(XmlElement::new("SignatureValue"))
        .child(XmlElement::new("KeyInfo").child(XmlElement::new("X509Data")))
}

/// 在 `Signature` 之后插入 `gCamFuFD/dCarQR`
pub fn attach_qr(rde: &mut XmlElement, qr_url: &str) {
    rde.remove_children("gCamFuFD");
    let fufd = XmlElement::new(rde.sibling_name("gCamFuFD"))
        .child(XmlElement::with_text(rde.sibling_name("dCarQR"), qr_url));
    rde.insert_after("Signature", fufd);
}
