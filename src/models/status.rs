//! SIFEN 响应码
//!
//! 响应码由 SIFEN 定义，这里只做分类：每个已知码映射到一个 [`CodeClass`]，
//! 其余代码一律按 [`CodeClass::Fatal`] 处理。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 响应码分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeClass {
    /// 批次已接收，等待处理
    Accepted,
    /// 批次处理中
    Processing,
    /// 批次处理完成
    Concluded,
    /// 单据审批通过
    Success,
    /// 连接正常，但业务上被阻断（需要在别处处理）
    BusinessBlocked,
    /// XML 结构缺陷，驱动补丁循环
    StructuralDefect,
    /// 批次或单据被拒绝
    Rejected,
    /// 无法继续
    Fatal,
}

/// 已知响应码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SifenCode {
    /// 0300 批次接收成功
    LotReceived,
    /// 0301 批次未入队
    LotNotQueued,
    /// 0360 批次号不存在
    LotNotFound,
    /// 0361 批次处理中
    LotProcessing,
    /// 0362 批次处理完成
    LotConcluded,
    /// 0364 批次查询超期
    LotQueryExpired,
    /// 0160 XML 格式错误
    MalformedXml,
    /// 0260 单据审批通过
    Approved,
    /// 0261 单据审批通过（有观察项）
    ApprovedWithObservation,
    /// 1264 RUC 未获授权
    RucNotEnabled,
}

static CODE_TABLE: phf::Map<&'static str, SifenCode> = phf::phf_map! {
    "0300" => SifenCode::LotReceived,
    "0301" => SifenCode::LotNotQueued,
    "0360" => SifenCode::LotNotFound,
    "0361" => SifenCode::LotProcessing,
    "0362" => SifenCode::LotConcluded,
    "0364" => SifenCode::LotQueryExpired,
    "0160" => SifenCode::MalformedXml,
    "0260" => SifenCode::Approved,
    "0261" => SifenCode::ApprovedWithObservation,
    "1264" => SifenCode::RucNotEnabled,
};

impl SifenCode {
    /// 从响应码解析（容忍首尾空白）
    pub fn from_code(code: &str) -> Option<Self> {
        CODE_TABLE.get(code.trim()).copied()
    }

    /// 获取响应码字符串
    pub fn code(self) -> &'static str {
        match self {
            SifenCode::LotReceived => "0300",
            SifenCode::LotNotQueued => "0301",
            SifenCode::LotNotFound => "0360",
            SifenCode::LotProcessing => "0361",
            SifenCode::LotConcluded => "0362",
            SifenCode::LotQueryExpired => "0364",
            SifenCode::MalformedXml => "0160",
            SifenCode::Approved => "0260",
            SifenCode::ApprovedWithObservation => "0261",
            SifenCode::RucNotEnabled => "1264",
        }
    }

    /// 响应码分类
    pub fn class(self) -> CodeClass {
        match self {
            SifenCode::LotReceived => CodeClass::Accepted,
            SifenCode::LotProcessing => CodeClass::Processing,
            SifenCode::LotConcluded => CodeClass::Concluded,
            SifenCode::Approved | SifenCode::ApprovedWithObservation => CodeClass::Success,
            SifenCode::RucNotEnabled => CodeClass::BusinessBlocked,
            SifenCode::MalformedXml => CodeClass::StructuralDefect,
            SifenCode::LotNotQueued => CodeClass::Rejected,
            SifenCode::LotNotFound | SifenCode::LotQueryExpired => CodeClass::Fatal,
        }
    }

    /// 标准描述
    pub fn description(self) -> &'static str {
        match self {
            SifenCode::LotReceived => "Lote recibido con éxito",
            SifenCode::LotNotQueued => "Lote no encolado para procesamiento",
            SifenCode::LotNotFound => "Número de lote inexistente",
            SifenCode::LotProcessing => "Lote en procesamiento",
            SifenCode::LotConcluded => "Procesamiento de lote concluido",
            SifenCode::LotQueryExpired => "Consulta extemporánea de lote",
            SifenCode::MalformedXml => "XML malformado",
            SifenCode::Approved => "Autorización del DE satisfactoria",
            SifenCode::ApprovedWithObservation => "Autorización del DE con observación",
            SifenCode::RucNotEnabled => "RUC no habilitado para facturación electrónica",
        }
    }
}

impl fmt::Display for SifenCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code(), self.description())
    }
}

/// 对任意响应码字符串分类，未知码视为致命
pub fn classify(code: &str) -> CodeClass {
    SifenCode::from_code(code)
        .map(SifenCode::class)
        .unwrap_or(CodeClass::Fatal)
}

/// 单据处理状态（`dEstRes`）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentState {
    Approved,
    ApprovedWithObservation,
    Rejected,
    Unknown,
}

impl DocumentState {
    pub fn parse(s: &str) -> Self {
        let lower = s.trim().to_lowercase();
        if lower.starts_with("aprobado con") {
            DocumentState::ApprovedWithObservation
        } else if lower.starts_with("aprobado") {
            DocumentState::Approved
        } else if lower.starts_with("rechazado") {
            DocumentState::Rejected
        } else {
            DocumentState::Unknown
        }
    }

    pub fn is_approved(self) -> bool {
        matches!(
            self,
            DocumentState::Approved | DocumentState::ApprovedWithObservation
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_roundtrip() {
        for (code, known) in CODE_TABLE.entries() {
            assert_eq!(known.code(), *code);
            assert_eq!(SifenCode::from_code(code), Some(*known));
        }
    }

    #[test]
    fn test_processing_is_never_success() {
        assert_eq!(classify("0361"), CodeClass::Processing);
        assert_ne!(classify("0361"), CodeClass::Success);
        assert_ne!(classify("0361"), CodeClass::Concluded);
    }

    #[test]
    fn test_business_blocked_and_unknown() {
        assert_eq!(classify("1264"), CodeClass::BusinessBlocked);
        assert_eq!(classify(" 0160 "), CodeClass::StructuralDefect);
        assert_eq!(classify("9999"), CodeClass::Fatal);
        assert_eq!(classify(""), CodeClass::Fatal);
    }

    #[test]
    fn test_document_state() {
        assert_eq!(DocumentState::parse("Aprobado"), DocumentState::Approved);
        assert_eq!(
            DocumentState::parse("Aprobado con observación"),
            DocumentState::ApprovedWithObservation
        );
        assert_eq!(DocumentState::parse("Rechazado"), DocumentState::Rejected);
        assert!(!DocumentState::parse("").is_approved());
    }
}
