//! DE 构建服务 - 业务能力层
//!
//! 只负责把一张发票描述转换为未签名的 `rDE`（版本 150），不关心签名与发送

use crate::error::{AppError, AppResult};
use crate::infrastructure::{XmlDocument, XmlElement};
use crate::models::cdc::{Cdc, CdcFields};
use crate::models::invoice::{InvoiceInput, InvoiceItem, IvaRate};
use chrono::{Local, NaiveDate, NaiveDateTime};
use rand::Rng;
use tracing::debug;

pub const SIFEN_NS: &str = "http://ekuatia.set.gov.py/sifen/xsd";
const XSI_NS: &str = "http://www.w3.org/2001/XMLSchema-instance";
const SCHEMA_LOCATION: &str = "http://ekuatia.set.gov.py/sifen/xsd siRecepDE_v150.xsd";
const FORMAT_VERSION: &str = "150";

/// 合计金额
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Totals {
    pub sub_exempt: u64,
    pub sub_5: u64,
    pub sub_10: u64,
    pub iva_5: u64,
    pub iva_10: u64,
}

impl Totals {
    /// 汇总商品行；任何金额超出 `u64` 时返回配置错误
    pub fn from_items(items: &[InvoiceItem]) -> AppResult<Self> {
        let mut totals = Totals::default();
        for (index, item) in items.iter().enumerate() {
            let total = line_total(index, item)?;
            let iva = item.iva.iva_included(total);
            let (sub, tax) = match item.iva {
                IvaRate::Ten => (&mut totals.sub_10, Some(&mut totals.iva_10)),
                IvaRate::Five => (&mut totals.sub_5, Some(&mut totals.iva_5)),
                IvaRate::Exempt => (&mut totals.sub_exempt, None),
            };
            *sub = sub.checked_add(total).ok_or_else(|| overflow(index))?;
            if let Some(tax) = tax {
                // iva <= total，子合计未溢出时税额合计也不会溢出
                *tax += iva;
            }
        }

        totals
            .sub_exempt
            .checked_add(totals.sub_5)
            .and_then(|sum| sum.checked_add(totals.sub_10))
            .ok_or_else(|| AppError::invalid_config("items", "合计金额超出范围"))?;
        Ok(totals)
    }

    pub fn total_operation(&self) -> u64 {
        self.sub_exempt + self.sub_5 + self.sub_10
    }

    pub fn total_iva(&self) -> u64 {
        self.iva_5 + self.iva_10
    }

    pub fn base_5(&self) -> u64 {
        self.sub_5 - self.iva_5
    }

    pub fn base_10(&self) -> u64 {
        self.sub_10 - self.iva_10
    }
}

/// 构建结果
#[derive(Debug, Clone)]
pub struct BuiltDocument {
    pub cdc: Cdc,
    pub document: XmlDocument,
    pub totals: Totals,
}

/// DE 构建器
pub struct DeBuilder {
    signed_at: NaiveDateTime,
}

impl DeBuilder {
    pub fn new() -> Self {
        Self {
            signed_at: Local::now().naive_local(),
        }
    }

    /// 固定签名时间（测试用）
    pub fn with_signed_at(signed_at: NaiveDateTime) -> Self {
        Self { signed_at }
    }

    /// 构建未签名的 `rDE`
    pub fn build(&self, invoice: &InvoiceInput) -> AppResult<BuiltDocument> {
        let security_code = invoice
            .security_code
            .clone()
            .unwrap_or_else(random_security_code);

        let cdc = Cdc::build(&CdcFields {
            document_type: invoice.document_type,
            ruc: invoice.issuer.ruc.clone(),
            ruc_dv: invoice.issuer.dv,
            establishment: invoice.stamp.establishment.clone(),
            expedition_point: invoice.stamp.expedition_point.clone(),
            number: invoice.stamp.document_number.clone(),
            taxpayer_type: invoice.issuer.taxpayer_type,
            issue_date: invoice.issued_at.date(),
            emission_type: 1,
            security_code: security_code.clone(),
        })?;
        debug!("生成 CDC: {}", cdc);

        let totals = Totals::from_items(&invoice.items)?;

        let mut dtip = XmlElement::new("gDtipDE")
            .child(
                XmlElement::new("gCamFE")
                    .child(XmlElement::with_text("iIndPres", "1"))
                    .child(XmlElement::with_text("dDesIndPres", "Operación presencial")),
            )
            .child(payment_condition(totals.total_operation()));
        for (index, item) in invoice.items.iter().enumerate() {
            dtip.push(item_element(item, line_total(index, item)?));
        }

        let de = XmlElement::new("DE")
            .attr("Id", cdc.as_str())
            .child(XmlElement::with_text("dDVId", cdc.check_digit()))
            .child(XmlElement::with_text("dFecFirma", format_datetime(&self.signed_at)))
            .child(XmlElement::with_text("dSisFact", "1"))
            .child(
                XmlElement::new("gOpeDE")
                    .child(XmlElement::with_text("iTipEmi", "1"))
                    .child(XmlElement::with_text("dDesTipEmi", "Normal"))
                    .child(XmlElement::with_text(
                        "dCodSeg",
                        format!("{:0>9}", security_code.trim()),
                    )),
            )
            .child(stamp_element(invoice)?)
            .child(general_data(invoice))
            .child(dtip)
            .child(totals_element(&totals));

        let root = XmlElement::new("rDE")
            .attr("xmlns", SIFEN_NS)
            .attr("xmlns:xsi", XSI_NS)
            .attr("xsi:schemaLocation", SCHEMA_LOCATION)
            .child(XmlElement::with_text("dVerFor", FORMAT_VERSION))
            .child(de);

        Ok(BuiltDocument {
            cdc,
            document: XmlDocument::new(root),
            totals,
        })
    }
}

impl Default for DeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn random_security_code() -> String {
    let code: u32 = rand::thread_rng().gen_range(1..=999_999_999);
    format!("{:09}", code)
}

fn format_datetime(dt: &NaiveDateTime) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S").to_string()
}

fn document_type_desc(document_type: u8) -> &'static str {
    match document_type {
        1 => "Factura electrónica",
        4 => "Autofactura electrónica",
        5 => "Nota de crédito electrónica",
        6 => "Nota de débito electrónica",
        7 => "Nota de remisión electrónica",
        _ => "Documento electrónico",
    }
}

fn stamp_element(invoice: &InvoiceInput) -> AppResult<XmlElement> {
    let valid_from = NaiveDate::parse_from_str(invoice.stamp.valid_from.trim(), "%Y-%m-%d")
        .map_err(|e| {
            crate::error::AppError::invalid_config(
                "stamp.valid_from",
                format!("'{}': {}", invoice.stamp.valid_from, e),
            )
        })?;

    Ok(XmlElement::new("gTimb")
        .child(XmlElement::with_text(
            "iTiDE",
            invoice.document_type.to_string(),
        ))
        .child(XmlElement::with_text(
            "dDesTiDE",
            document_type_desc(invoice.document_type),
        ))
        .child(XmlElement::with_text("dNumTim", invoice.stamp.number.trim()))
        .child(XmlElement::with_text(
            "dEst",
            format!("{:0>3}", invoice.stamp.establishment.trim()),
        ))
        .child(XmlElement::with_text(
            "dPunExp",
            format!("{:0>3}", invoice.stamp.expedition_point.trim()),
        ))
        .child(XmlElement::with_text(
            "dNumDoc",
            format!("{:0>7}", invoice.stamp.document_number.trim()),
        ))
        .child(XmlElement::with_text(
            "dFeIniT",
            valid_from.format("%Y-%m-%d").to_string(),
        )))
}

fn general_data(invoice: &InvoiceInput) -> XmlElement {
    let issuer = &invoice.issuer;
    let mut emis = XmlElement::new("gEmis")
        .child(XmlElement::with_text("dRucEm", issuer.ruc.trim()))
        .child(XmlElement::with_text("dDVEmi", issuer.dv.to_string()))
        .child(XmlElement::with_text(
            "iTipCont",
            issuer.taxpayer_type.to_string(),
        ))
        .child(XmlElement::with_text("dNomEmi", &issuer.name))
        .child(XmlElement::with_text("dDirEmi", &issuer.address))
        .child(XmlElement::with_text("dNumCas", &issuer.house_number))
        .child(XmlElement::with_text(
            "cDepEmi",
            issuer.department_code.to_string(),
        ))
        .child(XmlElement::with_text("dDesDepEmi", &issuer.department))
        .child(XmlElement::with_text("cCiuEmi", issuer.city_code.to_string()))
        .child(XmlElement::with_text("dDesCiuEmi", &issuer.city));
    if let Some(phone) = &issuer.phone {
        emis.push(XmlElement::with_text("dTelEmi", phone));
    }
    emis.push(XmlElement::with_text("dEmailE", &issuer.email));
    emis.push(
        XmlElement::new("gActEco")
            .child(XmlElement::with_text("cActEco", &issuer.activity_code))
            .child(XmlElement::with_text("dDesActEco", &issuer.activity)),
    );

    let receiver = &invoice.receiver;
    let mut rec = XmlElement::new("gDatRec");
    if receiver.is_taxpayer() {
        rec.push(XmlElement::with_text("iNatRec", "1"));
        rec.push(XmlElement::with_text("iTiOpe", "1"));
        rec.push(XmlElement::with_text("cPaisRec", "PRY"));
        rec.push(XmlElement::with_text("dDesPaisRe", "Paraguay"));
        rec.push(XmlElement::with_text("iTiContRec", "2"));
        rec.push(XmlElement::with_text(
            "dRucRec",
            receiver.ruc.as_deref().unwrap_or_default().trim(),
        ));
        rec.push(XmlElement::with_text(
            "dDVRec",
            receiver.dv.unwrap_or_default().to_string(),
        ));
    } else {
        rec.push(XmlElement::with_text("iNatRec", "2"));
        rec.push(XmlElement::with_text("iTiOpe", "2"));
        rec.push(XmlElement::with_text("cPaisRec", "PRY"));
        rec.push(XmlElement::with_text("dDesPaisRe", "Paraguay"));
        rec.push(XmlElement::with_text("iTipIDRec", "1"));
        rec.push(XmlElement::with_text("dDTipIDRec", "Cédula paraguaya"));
        rec.push(XmlElement::with_text(
            "dNumIDRec",
            receiver.id_number.as_deref().unwrap_or("0").trim(),
        ));
    }
    rec.push(XmlElement::with_text("dNomRec", &receiver.name));

    XmlElement::new("gDatGralOpe")
        .child(XmlElement::with_text(
            "dFeEmiDE",
            format_datetime(&invoice.issued_at),
        ))
        .child(
            XmlElement::new("gOpeCom")
                .child(XmlElement::with_text("iTipTra", "1"))
                .child(XmlElement::with_text("dDesTipTra", "Venta de mercadería"))
                .child(XmlElement::with_text("iTImp", "1"))
                .child(XmlElement::with_text("dDesTImp", "IVA"))
                .child(XmlElement::with_text("cMoneOpe", "PYG"))
                .child(XmlElement::with_text("dDesMoneOpe", "Guarani")),
        )
        .child(emis)
        .child(rec)
}

fn payment_condition(total: u64) -> XmlElement {
    XmlElement::new("gCamCond")
        .child(XmlElement::with_text("iCondOpe", "1"))
        .child(XmlElement::with_text("dDCondOpe", "Contado"))
        .child(
            XmlElement::new("gPaConEIni")
                .child(XmlElement::with_text("iTiPago", "1"))
                .child(XmlElement::with_text("dDesTiPag", "Efectivo"))
                .child(XmlElement::with_text("dMonTiPag", total.to_string()))
                .child(XmlElement::with_text("cMoneTiPag", "PYG"))
                .child(XmlElement::with_text("dDMoneTiPag", "Guarani")),
        )
}

fn line_total(index: usize, item: &InvoiceItem) -> AppResult<u64> {
    item.total().ok_or_else(|| overflow(index))
}

fn overflow(index: usize) -> AppError {
    AppError::invalid_config(format!("items[{}]", index), "金额超出范围")
}

fn item_element(item: &InvoiceItem, total: u64) -> XmlElement {
    let iva = item.iva.iva_included(total);
    let base = match item.iva {
        IvaRate::Exempt => 0,
        _ => total - iva,
    };

    XmlElement::new("gCamItem")
        .child(XmlElement::with_text("dCodInt", &item.code))
        .child(XmlElement::with_text("dDesProSer", &item.description))
        .child(XmlElement::with_text("cUniMed", "77"))
        .child(XmlElement::with_text("dDesUniMed", "UNI"))
        .child(XmlElement::with_text(
            "dCantProSer",
            item.quantity.to_string(),
        ))
        .child(
            XmlElement::new("gValorItem")
                .child(XmlElement::with_text(
                    "dPUniProSer",
                    item.unit_price.to_string(),
                ))
                .child(XmlElement::with_text("dTotBruOpeItem", total.to_string()))
                .child(
                    XmlElement::new("gValorRestaItem")
                        .child(XmlElement::with_text("dDescItem", "0"))
                        .child(XmlElement::with_text("dDescGloItem", "0"))
                        .child(XmlElement::with_text("dAntPreUniIt", "0"))
                        .child(XmlElement::with_text("dAntGloPreUniIt", "0"))
                        .child(XmlElement::with_text("dTotOpeItem", total.to_string())),
                ),
        )
        .child(
            XmlElement::new("gCamIVA")
                .child(XmlElement::with_text(
                    "iAfecIVA",
                    item.iva.affectation().to_string(),
                ))
                .child(XmlElement::with_text(
                    "dDesAfecIVA",
                    item.iva.affectation_desc(),
                ))
                .child(XmlElement::with_text(
                    "dPropIVA",
                    if item.iva == IvaRate::Exempt { "0" } else { "100" },
                ))
                .child(XmlElement::with_text("dTasaIVA", item.iva.rate().to_string()))
                .child(XmlElement::with_text("dBasGravIVA", base.to_string()))
                .child(XmlElement::with_text("dLiqIVAItem", iva.to_string()))
                .child(XmlElement::with_text("dBasExe", "0")),
        )
}

fn totals_element(totals: &Totals) -> XmlElement {
    let total = totals.total_operation();
    let fields: [(&str, u64); 20] = [
        ("dSubExe", totals.sub_exempt),
        ("dSubExo", 0),
        ("dSub5", totals.sub_5),
        ("dSub10", totals.sub_10),
        ("dTotOpe", total),
        ("dTotDesc", 0),
        ("dTotDescGlotem", 0),
        ("dTotAntItem", 0),
        ("dTotAnt", 0),
        ("dPorcDescTotal", 0),
        ("dDescTotal", 0),
        ("dAnticipo", 0),
        ("dRedon", 0),
        ("dTotGralOpe", total),
        ("dIVA5", totals.iva_5),
        ("dIVA10", totals.iva_10),
        ("dTotIVA", totals.total_iva()),
        ("dBaseGrav5", totals.base_5()),
        ("dBaseGrav10", totals.base_10()),
        ("dTBasGraIVA", totals.base_5() + totals.base_10()),
    ];

    let mut element = XmlElement::new("gTotSub");
    for (name, value) in fields {
        element.push(XmlElement::with_text(name, value.to_string()));
    }
    element
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = include_str!("../../tests/fixtures/factura.toml");

    fn build_sample() -> BuiltDocument {
        let invoice: InvoiceInput = toml::from_str(SAMPLE).unwrap();
        let signed_at = NaiveDate::from_ymd_opt(2024, 3, 15)
            .unwrap()
            .and_hms_opt(10, 31, 0)
            .unwrap();
        DeBuilder::with_signed_at(signed_at).build(&invoice).unwrap()
    }

    #[test]
    fn test_totals() {
        let built = build_sample();
        assert_eq!(built.totals.sub_10, 110_000);
        assert_eq!(built.totals.iva_10, 10_000);
        assert_eq!(built.totals.sub_exempt, 50_000);
        assert_eq!(built.totals.total_operation(), 160_000);
        assert_eq!(built.totals.base_10(), 100_000);
    }

    #[test]
    fn test_amount_overflow_is_config_error() {
        let mut invoice: InvoiceInput = toml::from_str(SAMPLE).unwrap();
        invoice.items[0].quantity = u64::MAX;
        invoice.items[0].unit_price = 2;
        let err = DeBuilder::new().build(&invoice).unwrap_err();
        assert_eq!(err.exit_status(), crate::error::ExitStatus::Config);

        let mut invoice: InvoiceInput = toml::from_str(SAMPLE).unwrap();
        invoice.items[0].quantity = 1;
        invoice.items[0].unit_price = u64::MAX;
        invoice.items[1].quantity = 1;
        invoice.items[1].unit_price = 1;
        // 两个子合计各自不溢出，总额溢出
        assert!(Totals::from_items(&invoice.items).is_err());
    }

    #[test]
    fn test_document_structure() {
        let built = build_sample();
        let root = &built.document.root;
        assert_eq!(root.local_name(), "rDE");
        assert_eq!(root.child_names(), vec!["dVerFor", "DE"]);

        let de = root.child_by_name("DE").unwrap();
        assert_eq!(de.get_attr("Id").as_deref(), Some(built.cdc.as_str()));
        assert_eq!(
            de.child_text("dDVId").as_deref(),
            Some(built.cdc.check_digit())
        );
        assert_eq!(
            de.child_names(),
            vec![
                "dDVId",
                "dFecFirma",
                "dSisFact",
                "gOpeDE",
                "gTimb",
                "gDatGralOpe",
                "gDtipDE",
                "gTotSub"
            ]
        );

        let mut items = Vec::new();
        de.find_all("gCamItem", &mut items);
        assert_eq!(items.len(), 2);

        let totals = de.child_by_name("gTotSub").unwrap();
        assert_eq!(totals.child_text("dTotGralOpe").as_deref(), Some("160000"));
        assert_eq!(totals.child_text("dTotIVA").as_deref(), Some("10000"));
        assert_eq!(root.find("dRucRec").unwrap().text(), "80069563");
    }

    #[test]
    fn test_serializes() {
        let built = build_sample();
        let xml = built.document.to_xml_string().unwrap();
        assert!(xml.starts_with(r#"<?xml version="1.0" encoding="UTF-8"?><rDE xmlns="#));
        assert!(xml.contains("<dDesPaisRe>Paraguay</dDesPaisRe>"));
        let reparsed = XmlDocument::parse(&xml).unwrap();
        assert_eq!(reparsed.to_xml_string().unwrap(), xml);
    }
}
