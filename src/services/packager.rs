//! 批次打包服务 - 业务能力层
//!
//! `rDE` / `rLoteDE` → `lote.xml` → zip → base64 → SOAP 1.2 信封。
//! 已签名的 `rDE` 按原始字节写回，不会因为重新打包而破坏签名。

use crate::error::{AppResult, ProtocolError};
use crate::infrastructure::{XmlDocument, XmlElement, XmlNode};
use crate::models::cdc::Cdc;
use crate::services::de_builder::SIFEN_NS;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Local;
use rand::Rng;
use std::io::{Cursor, Write};
use tracing::debug;

/// 单个批次最多包含的文档数
pub const MAX_LOT_SIZE: usize = 50;

const SOAP12_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
const LOTE_ENTRY: &str = "lote.xml";

/// 校验过的批次
#[derive(Debug, Clone)]
pub struct Lot {
    document: XmlDocument,
    cdcs: Vec<Cdc>,
}

impl Lot {
    /// 从 `rDE` 或 `rLoteDE` 构造批次
    ///
    /// - 根为 `rDE` 时包一层 `rLoteDE`
    /// - 根为 `rLoteDE` 时直接子元素必须全部是 `rDE`（不允许多余的包装层）
    /// - 文档数 1..=50，RUC 与文档类型必须一致
    pub fn from_xml(xml: &str) -> AppResult<Self> {
        let parsed = XmlDocument::parse(xml)?;

        let root_name = parsed.root.local_name().to_string();
        let document = match root_name.as_str() {
            "rDE" => XmlDocument::new(
                XmlElement::new("rLoteDE")
                    .attr("xmlns", SIFEN_NS)
                    .child(parsed.root),
            ),
            "rLoteDE" => parsed,
            other => {
                return Err(ProtocolError::InvalidLot(format!(
                    "根元素必须是 rDE 或 rLoteDE，实际为 <{}>",
                    other
                ))
                .into())
            }
        };

        let mut cdcs = Vec::new();
        for node in &document.root.children {
            let XmlNode::Element(child) = node else {
                continue;
            };
            if child.local_name() != "rDE" {
                return Err(ProtocolError::InvalidLot(format!(
                    "rLoteDE 只能直接包含 rDE，发现 <{}>",
                    child.name()
                ))
                .into());
            }
            let id = child
                .child_by_name("DE")
                .and_then(|de| de.get_attr("Id"))
                .ok_or_else(|| ProtocolError::InvalidLot("rDE 缺少 DE/@Id".to_string()))?;
            cdcs.push(Cdc::parse(&id)?);
        }

        validate_members(&cdcs)?;
        debug!("批次包含 {} 个文档", cdcs.len());
        Ok(Self { document, cdcs })
    }

    pub fn cdcs(&self) -> &[Cdc] {
        &self.cdcs
    }

    pub fn len(&self) -> usize {
        self.cdcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cdcs.is_empty()
    }

    /// `lote.xml` 内容
    pub fn to_lote_xml(&self) -> AppResult<String> {
        Ok(self.document.to_xml_string()?)
    }
}

fn validate_members(cdcs: &[Cdc]) -> Result<(), ProtocolError> {
    let first = cdcs
        .first()
        .ok_or_else(|| ProtocolError::InvalidLot("批次中没有 rDE".to_string()))?;

    if cdcs.len() > MAX_LOT_SIZE {
        return Err(ProtocolError::InvalidLot(format!(
            "批次最多 {} 个文档，实际 {}",
            MAX_LOT_SIZE,
            cdcs.len()
        )));
    }

    for cdc in &cdcs[1..] {
        if cdc.ruc() != first.ruc() {
            return Err(ProtocolError::InvalidLot(format!(
                "RUC 不一致: {} / {}",
                first.ruc(),
                cdc.ruc()
            )));
        }
        if cdc.document_type() != first.document_type() {
            return Err(ProtocolError::InvalidLot(format!(
                "文档类型不一致: {} / {}",
                first.document_type(),
                cdc.document_type()
            )));
        }
    }
    Ok(())
}

/// 打包结果
#[derive(Debug, Clone)]
pub struct PackagedLot {
    pub request_id: String,
    pub lote_xml: String,
    pub envelope: String,
    pub cdcs: Vec<Cdc>,
}

/// 完整打包：校验 → lote.xml → zip → base64 → `rEnvioLote` 信封
pub fn package(xml: &str) -> AppResult<PackagedLot> {
    let lot = Lot::from_xml(xml)?;
    let lote_xml = lot.to_lote_xml()?;
    let payload = STANDARD.encode(zip_lote(&lote_xml)?);
    let request_id = request_id();
    let envelope = send_envelope(&request_id, &payload)?;

    Ok(PackagedLot {
        request_id,
        lote_xml,
        envelope,
        cdcs: lot.cdcs,
    })
}

/// 把 `lote.xml` 压缩为只有一个条目的 zip
pub fn zip_lote(lote_xml: &str) -> Result<Vec<u8>, ProtocolError> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        writer.start_file(LOTE_ENTRY, options)?;
        writer
            .write_all(lote_xml.as_bytes())
            .map_err(zip::result::ZipError::from)?;
        writer.finish()?;
    }
    Ok(cursor.into_inner())
}

/// 请求编号 `dId`：时间戳 + 3 位随机数，共 15 位数字
pub fn request_id() -> String {
    let suffix: u16 = rand::thread_rng().gen_range(0..1000);
    format!("{}{:03}", Local::now().format("%y%m%d%H%M%S"), suffix)
}

/// `rEnvioLote` 信封
pub fn send_envelope(request_id: &str, payload_b64: &str) -> AppResult<String> {
    let body = XmlElement::new("rEnvioLote")
        .attr("xmlns", SIFEN_NS)
        .child(XmlElement::with_text("dId", request_id))
        .child(XmlElement::with_text("xDE", payload_b64));
    soap_envelope(body)
}

/// `rEnviConsLoteDe` 信封
pub fn query_envelope(request_id: &str, protocol: &str) -> AppResult<String> {
    let body = XmlElement::new("rEnviConsLoteDe")
        .attr("xmlns", SIFEN_NS)
        .child(XmlElement::with_text("dId", request_id))
        .child(XmlElement::with_text("dProtConsLote", protocol));
    soap_envelope(body)
}

fn soap_envelope(body: XmlElement) -> AppResult<String> {
    let envelope = XmlElement::new("soap:Envelope")
        .attr("xmlns:soap", SOAP12_NS)
        .child(XmlElement::new("soap:Header"))
        .child(XmlElement::new("soap:Body").child(body));
    Ok(XmlDocument::new(envelope).to_xml_string()?)
}
