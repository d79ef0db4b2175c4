//! SOAP 响应解析
//!
//! 按本地名查找元素，不依赖具体的命名空间前缀（SIFEN 在不同环境返回的前缀不同）

use crate::error::{AppError, AppResult, ProtocolError};
use crate::infrastructure::{XmlDocument, XmlElement};
use crate::models::response::{DocumentResult, LotResponse, ResultMessage, SendResponse};

/// 解析 `rResEnviLoteDe`
pub fn parse_send_response(xml: &str) -> AppResult<SendResponse> {
    let doc = XmlDocument::parse(xml)?;
    check_fault(&doc.root)?;

    let body = doc
        .root
        .find("rResEnviLoteDe")
        .ok_or_else(|| AppError::missing_element("rResEnviLoteDe"))?;

    Ok(SendResponse {
        code: required(body, "dCodRes")?,
        message: body.find("dMsgRes").map(XmlElement::text).unwrap_or_default(),
        protocol: optional(body, "dProtConsLote"),
        processing_time: optional(body, "dTpoProces"),
        processed_at: optional(body, "dFecProc"),
    })
}

/// 解析 `rResEnviConsLoteDe`
pub fn parse_lot_response(xml: &str) -> AppResult<LotResponse> {
    let doc = XmlDocument::parse(xml)?;
    check_fault(&doc.root)?;

    let body = doc
        .root
        .find("rResEnviConsLoteDe")
        .ok_or_else(|| AppError::missing_element("rResEnviConsLoteDe"))?;

    let mut groups = Vec::new();
    body.find_all("gResProcLote", &mut groups);

    let documents = groups
        .into_iter()
        .map(|group| {
            let mut procs = Vec::new();
            group.find_all("gResProc", &mut procs);
            DocumentResult {
                cdc: group.child_text("id").unwrap_or_default(),
                status: group.child_text("dEstRes").unwrap_or_default(),
                results: procs
                    .into_iter()
                    .map(|p| ResultMessage {
                        code: p.child_text("dCodRes").unwrap_or_default(),
                        message: p.child_text("dMsgRes").unwrap_or_default(),
                    })
                    .collect(),
            }
        })
        .collect();

    Ok(LotResponse {
        code: required(body, "dCodResLot")?,
        message: body
            .find("dMsgResLot")
            .map(XmlElement::text)
            .unwrap_or_default(),
        documents,
    })
}

fn check_fault(root: &XmlElement) -> Result<(), ProtocolError> {
    let Some(fault) = root.find("Fault") else {
        return Ok(());
    };
    let code = fault
        .find("Code")
        .and_then(|c| c.find("Value"))
        .map(XmlElement::text)
        .unwrap_or_default();
    let reason = fault
        .find("Reason")
        .and_then(|r| r.find("Text"))
        .map(XmlElement::text)
        .unwrap_or_else(|| fault.text());
    Err(ProtocolError::SoapFault { code, reason })
}

fn required(element: &XmlElement, local: &str) -> AppResult<String> {
    element
        .find(local)
        .map(XmlElement::text)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::missing_element(local))
}

fn optional(element: &XmlElement, local: &str) -> Option<String> {
    element
        .find(local)
        .map(XmlElement::text)
        .filter(|t| !t.is_empty())
}
