//! 发票描述（TOML 输入）

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// IVA 税率
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IvaRate {
    /// 10 %
    #[serde(rename = "10")]
    Ten,
    /// 5 %
    #[serde(rename = "5")]
    Five,
    /// 免税
    Exempt,
}

impl IvaRate {
    /// `dTasaIVA`
    pub fn rate(self) -> u64 {
        match self {
            IvaRate::Ten => 10,
            IvaRate::Five => 5,
            IvaRate::Exempt => 0,
        }
    }

    /// `iAfecIVA`：1 = 应税，3 = 免税
    pub fn affectation(self) -> u8 {
        match self {
            IvaRate::Ten | IvaRate::Five => 1,
            IvaRate::Exempt => 3,
        }
    }

    /// `dDesAfecIVA`
    pub fn affectation_desc(self) -> &'static str {
        match self {
            IvaRate::Ten | IvaRate::Five => "Gravado IVA",
            IvaRate::Exempt => "Exento",
        }
    }

    /// 含税金额中的 IVA（四舍五入到整数瓜拉尼）
    pub fn iva_included(self, total: u64) -> u64 {
        match self {
            IvaRate::Ten => round_div(total, 11),
            IvaRate::Five => round_div(total, 21),
            IvaRate::Exempt => 0,
        }
    }
}

/// 四舍五入整除，不会因 `value` 接近上限而溢出
fn round_div(value: u64, divisor: u64) -> u64 {
    let quotient = value / divisor;
    if value % divisor >= divisor - divisor / 2 {
        quotient + 1
    } else {
        quotient
    }
}

/// 开票方
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issuer {
    pub ruc: String,
    pub dv: u8,
    pub name: String,
    /// 1 = 自然人，2 = 法人
    #[serde(default = "default_taxpayer_type")]
    pub taxpayer_type: u8,
    pub address: String,
    #[serde(default = "default_house_number")]
    pub house_number: String,
    pub department_code: u16,
    pub department: String,
    pub city_code: u32,
    pub city: String,
    #[serde(default)]
    pub phone: Option<String>,
    pub email: String,
    pub activity_code: String,
    pub activity: String,
}

fn default_taxpayer_type() -> u8 {
    2
}

fn default_house_number() -> String {
    "0".to_string()
}

/// 收票方
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receiver {
    pub name: String,
    /// 有 RUC 时为纳税人
    #[serde(default)]
    pub ruc: Option<String>,
    #[serde(default)]
    pub dv: Option<u8>,
    /// 无 RUC 时的证件号
    #[serde(default)]
    pub id_number: Option<String>,
}

impl Receiver {
    pub fn is_taxpayer(&self) -> bool {
        self.ruc.as_deref().is_some_and(|r| !r.trim().is_empty())
    }
}

/// 商品行
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceItem {
    pub code: String,
    pub description: String,
    pub quantity: u64,
    /// 含税单价（瓜拉尼）
    pub unit_price: u64,
    pub iva: IvaRate,
}

impl InvoiceItem {
    /// 含税行合计，溢出时为 `None`
    pub fn total(&self) -> Option<u64> {
        self.quantity.checked_mul(self.unit_price)
    }
}

/// 盖章信息（timbrado）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stamp {
    pub number: String,
    pub establishment: String,
    pub expedition_point: String,
    pub document_number: String,
    /// 开始生效日期 YYYY-MM-DD
    pub valid_from: String,
}

/// 完整发票输入
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceInput {
    /// `iTiDE`，默认 1（电子发票）
    #[serde(default = "default_document_type")]
    pub document_type: u8,
    pub issued_at: NaiveDateTime,
    /// 9 位安全码；缺省时由 CDC 生成时随机产生
    #[serde(default)]
    pub security_code: Option<String>,
    pub stamp: Stamp,
    pub issuer: Issuer,
    pub receiver: Receiver,
    pub items: Vec<InvoiceItem>,
    /// 仅用于生成后回填来源路径
    #[serde(skip)]
    pub file_path: Option<String>,
}

fn default_document_type() -> u8 {
    1
}

impl InvoiceInput {
    /// 检查构建 DE 之前就能发现的问题，返回所有问题的描述
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let mut digits = |field: &str, value: &str, max_len: usize| {
            let value = value.trim();
            if value.is_empty() || value.len() > max_len || !value.chars().all(|c| c.is_ascii_digit()) {
                problems.push(format!("{} 必须是 1-{} 位数字，实际为 '{}'", field, max_len, value));
            }
        };

        digits("issuer.ruc", &self.issuer.ruc, 8);
        digits("stamp.number", &self.stamp.number, 8);
        digits("stamp.establishment", &self.stamp.establishment, 3);
        digits("stamp.expedition_point", &self.stamp.expedition_point, 3);
        digits("stamp.document_number", &self.stamp.document_number, 7);
        if let Some(code) = &self.security_code {
            digits("security_code", code, 9);
        }
        if let Some(ruc) = self.receiver.ruc.as_deref().filter(|r| !r.trim().is_empty()) {
            digits("receiver.ruc", ruc, 8);
        }

        if self.issuer.dv > 9 {
            problems.push(format!("issuer.dv 必须是 0-9，实际为 {}", self.issuer.dv));
        }
        if !matches!(self.issuer.taxpayer_type, 1 | 2) {
            problems.push(format!(
                "issuer.taxpayer_type 必须是 1 或 2，实际为 {}",
                self.issuer.taxpayer_type
            ));
        }
        if self.receiver.is_taxpayer() && self.receiver.dv.is_none() {
            problems.push("receiver.dv 缺失（有 RUC 时必填）".to_string());
        }
        if !self.receiver.is_taxpayer()
            && self.receiver.id_number.as_deref().map_or(true, |n| n.trim().is_empty())
        {
            problems.push("receiver 需要 ruc 或 id_number".to_string());
        }
        if chrono::NaiveDate::parse_from_str(&self.stamp.valid_from, "%Y-%m-%d").is_err() {
            problems.push(format!("stamp.valid_from 不是 YYYY-MM-DD: '{}'", self.stamp.valid_from));
        }

        if self.items.is_empty() {
            problems.push("发票没有商品行".to_string());
        }
        for (index, item) in self.items.iter().enumerate() {
            if item.quantity == 0 {
                problems.push(format!("items[{}] ({}) 数量为 0", index, item.code));
            }
            if item.total().is_none() {
                problems.push(format!("items[{}] ({}) 数量 × 单价超出范围", index, item.code));
            }
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iva_included() {
        assert_eq!(IvaRate::Ten.iva_included(110_000), 10_000);
        assert_eq!(IvaRate::Five.iva_included(21_000), 1_000);
        assert_eq!(IvaRate::Exempt.iva_included(5_000), 0);
        // 15000 / 11 = 1363.6 → 1364
        assert_eq!(IvaRate::Ten.iva_included(15_000), 1_364);
    }

    #[test]
    fn test_iva_near_upper_bound() {
        // u64::MAX % 11 == 4，向下取整
        assert_eq!(IvaRate::Ten.iva_included(u64::MAX), u64::MAX / 11);
        assert_eq!(round_div(10, 4), 3);
        assert_eq!(round_div(9, 4), 2);
    }

    #[test]
    fn test_item_total_overflow() {
        let item = InvoiceItem {
            code: "X".to_string(),
            description: "x".to_string(),
            quantity: u64::MAX,
            unit_price: 2,
            iva: IvaRate::Ten,
        };
        assert_eq!(item.total(), None);
    }

    #[test]
    fn test_rate_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            iva: IvaRate,
        }
        let w: Wrapper = toml::from_str(r#"iva = "5""#).unwrap();
        assert_eq!(w.iva, IvaRate::Five);
        let w: Wrapper = toml::from_str(r#"iva = "exempt""#).unwrap();
        assert_eq!(w.iva, IvaRate::Exempt);
    }
}
