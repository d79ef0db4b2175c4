//! CDC（Código de Control）
//!
//! 44 位：
//! `iTiDE(2) dRucEm(8) dDVEmi(1) dEst(3) dPunExp(3) dNumDoc(7) iTipCont(1)
//! dFeEmiDE(8) iTipEmi(1) dCodSeg(9) dDVId(1)`

use crate::error::ProtocolError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const CDC_LEN: usize = 44;

/// 模 11 校验位（RUC 与 CDC 通用）
pub fn mod11_check_digit(digits: &str) -> u32 {
    const BASE_MAX: u32 = 11;
    let mut total = 0u32;
    let mut k = 2u32;
    for c in digits.chars().rev() {
        let value = c.to_digit(10).unwrap_or(c as u32);
        total += value * k;
        k = if k >= BASE_MAX { 2 } else { k + 1 };
    }
    let rest = total % 11;
    if rest > 1 {
        11 - rest
    } else {
        0
    }
}

/// 生成 CDC 所需的字段
#[derive(Debug, Clone)]
pub struct CdcFields {
    pub document_type: u8,
    pub ruc: String,
    pub ruc_dv: u8,
    pub establishment: String,
    pub expedition_point: String,
    pub number: String,
    pub taxpayer_type: u8,
    pub issue_date: NaiveDate,
    pub emission_type: u8,
    pub security_code: String,
}

/// 已校验的 CDC
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cdc(String);

impl Cdc {
    /// 由字段生成
    pub fn build(fields: &CdcFields) -> Result<Self, ProtocolError> {
        let body = format!(
            "{:02}{}{}{}{}{}{}{}{}{}",
            fields.document_type,
            pad_digits("dRucEm", &fields.ruc, 8)?,
            fields.ruc_dv,
            pad_digits("dEst", &fields.establishment, 3)?,
            pad_digits("dPunExp", &fields.expedition_point, 3)?,
            pad_digits("dNumDoc", &fields.number, 7)?,
            fields.taxpayer_type,
            fields.issue_date.format("%Y%m%d"),
            fields.emission_type,
            pad_digits("dCodSeg", &fields.security_code, 9)?,
        );
        if body.len() != CDC_LEN - 1 {
            return Err(ProtocolError::InvalidCdc(format!(
                "字段拼接长度为 {}，应为 {}",
                body.len(),
                CDC_LEN - 1
            )));
        }
        let dv = mod11_check_digit(&body);
        Ok(Self(format!("{}{}", body, dv)))
    }

    /// 解析并校验
    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        let s = s.trim();
        if s.len() != CDC_LEN || !s.chars().all(|c| c.is_ascii_digit()) {
            return Err(ProtocolError::InvalidCdc(format!("'{}' 不是 44 位数字", s)));
        }
        let (body, dv) = s.split_at(CDC_LEN - 1);
        let expected = mod11_check_digit(body);
        if dv != expected.to_string() {
            return Err(ProtocolError::InvalidCdc(format!(
                "校验位 {} 不正确，应为 {}",
                dv, expected
            )));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 单据类型（前 2 位）
    pub fn document_type(&self) -> &str {
        &self.0[0..2]
    }

    /// 开票方 RUC（不含校验位）
    pub fn ruc(&self) -> &str {
        &self.0[2..10]
    }

    /// 校验位
    pub fn check_digit(&self) -> &str {
        &self.0[43..44]
    }
}

impl fmt::Display for Cdc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Cdc {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Cdc::parse(&value)
    }
}

impl From<Cdc> for String {
    fn from(cdc: Cdc) -> Self {
        cdc.0
    }
}

fn pad_digits(field: &str, value: &str, width: usize) -> Result<String, ProtocolError> {
    let value = value.trim();
    if value.is_empty() || !value.chars().all(|c| c.is_ascii_digit()) || value.len() > width {
        return Err(ProtocolError::InvalidCdc(format!(
            "{} = '{}' 必须是不超过 {} 位的数字",
            field, value, width
        )));
    }
    Ok(format!("{:0>width$}", value, width = width))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> CdcFields {
        CdcFields {
            document_type: 1,
            ruc: "80012345".to_string(),
            ruc_dv: 7,
            establishment: "1".to_string(),
            expedition_point: "1".to_string(),
            number: "42".to_string(),
            taxpayer_type: 2,
            issue_date: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            emission_type: 1,
            security_code: "123456789".to_string(),
        }
    }

    #[test]
    fn test_check_digit_known_ruc() {
        // RUC 80069563-1
        assert_eq!(mod11_check_digit("80069563"), 1);
    }

    #[test]
    fn test_build_layout() {
        let cdc = Cdc::build(&fields()).unwrap();
        assert_eq!(cdc.as_str().len(), CDC_LEN);
        assert!(cdc.as_str().starts_with("01800123457001001000004222024031511234567"));
        assert_eq!(cdc.document_type(), "01");
        assert_eq!(cdc.ruc(), "80012345");
        assert!(Cdc::parse(cdc.as_str()).is_ok());
    }

    #[test]
    fn test_parse_rejects_bad_check_digit() {
        let cdc = Cdc::build(&fields()).unwrap();
        let mut s = cdc.as_str()[..43].to_string();
        let wrong = (cdc.check_digit().parse::<u32>().unwrap() + 1) % 10;
        s.push_str(&wrong.to_string());
        assert!(Cdc::parse(&s).is_err());
        assert!(Cdc::parse("123").is_err());
    }

    #[test]
    fn test_rejects_oversized_field() {
        let mut f = fields();
        f.number = "12345678".to_string();
        assert!(Cdc::build(&f).is_err());
    }
}
