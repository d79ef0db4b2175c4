use crate::models::status::{classify, CodeClass, DocumentState, SifenCode};
use serde::{Deserialize, Serialize};

/// 批次提交响应（`rResEnviLoteDe`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendResponse {
    /// `dCodRes`
    pub code: String,
    /// `dMsgRes`
    pub message: String,
    /// `dProtConsLote`，批次被接收时才有
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// `dTpoProces`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<String>,
    /// 响应时间 `dFecProc`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<String>,
}

impl SendResponse {
    pub fn class(&self) -> CodeClass {
        classify(&self.code)
    }

    /// 有效的批次号（去除空白，空串视为无）
    pub fn protocol(&self) -> Option<&str> {
        self.protocol
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty() && *p != "0")
    }
}

/// 单条处理结果（`gResProc`）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub code: String,
    pub message: String,
}

/// 单据处理结果（`gResProcLote`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentResult {
    /// CDC
    pub cdc: String,
    /// `dEstRes` 原文
    pub status: String,
    #[serde(default)]
    pub results: Vec<ResultMessage>,
}

impl DocumentResult {
    pub fn state(&self) -> DocumentState {
        DocumentState::parse(&self.status)
    }

    /// 是否包含指定响应码
    pub fn find_code(&self, code: SifenCode) -> Option<&ResultMessage> {
        self.results.iter().find(|r| r.code.trim() == code.code())
    }
}

/// 批次查询响应（`rResEnviConsLoteDe`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LotResponse {
    /// `dCodResLot`
    pub code: String,
    /// `dMsgResLot`
    pub message: String,
    #[serde(default)]
    pub documents: Vec<DocumentResult>,
}

impl LotResponse {
    pub fn class(&self) -> CodeClass {
        classify(&self.code)
    }

    /// 第一条单据级 0160 结果
    pub fn malformed_xml(&self) -> Option<&ResultMessage> {
        self.documents
            .iter()
            .find_map(|d| d.find_code(SifenCode::MalformedXml))
    }

    /// 第一条 1264 结果
    pub fn business_blocker(&self) -> Option<&ResultMessage> {
        self.documents
            .iter()
            .find_map(|d| d.find_code(SifenCode::RucNotEnabled))
    }

    pub fn approved_count(&self) -> usize {
        self.documents
            .iter()
            .filter(|d| d.state().is_approved())
            .count()
    }

    /// 未通过的单据 CDC
    pub fn rejected_cdcs(&self) -> Vec<String> {
        self.documents
            .iter()
            .filter(|d| !d.state().is_approved())
            .map(|d| d.cdc.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(cdc: &str, status: &str, code: &str, msg: &str) -> DocumentResult {
        DocumentResult {
            cdc: cdc.to_string(),
            status: status.to_string(),
            results: vec![ResultMessage {
                code: code.to_string(),
                message: msg.to_string(),
            }],
        }
    }

    #[test]
    fn test_send_protocol_filters_empty() {
        let mut resp = SendResponse {
            code: "0300".to_string(),
            message: "ok".to_string(),
            protocol: Some(" 123 ".to_string()),
            processing_time: None,
            processed_at: None,
        };
        assert_eq!(resp.protocol(), Some("123"));
        resp.protocol = Some("0".to_string());
        assert_eq!(resp.protocol(), None);
    }

    #[test]
    fn test_lot_helpers() {
        let lot = LotResponse {
            code: "0362".to_string(),
            message: "concluido".to_string(),
            documents: vec![
                doc("A", "Aprobado", "0260", "ok"),
                doc("B", "Rechazado", "0160", "XML malformado"),
            ],
        };
        assert_eq!(lot.approved_count(), 1);
        assert_eq!(lot.rejected_cdcs(), vec!["B".to_string()]);
        assert_eq!(lot.malformed_xml().unwrap().message, "XML malformado");
        assert!(lot.business_blocker().is_none());
    }

    #[test]
    fn test_json_shape() {
        let json = r#"{"code":"0300","message":"Lote recibido","protocol":"987"}"#;
        let resp: SendResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.class(), CodeClass::Accepted);
        assert_eq!(resp.protocol(), Some("987"));
    }
}
