//! 二维码 URL 生成
//!
//! 所有参数都从已签名的 `rDE` 中读取，CSC 只参与哈希计算，不出现在 URL 中

use crate::error::SigningError;
use crate::infrastructure::XmlElement;
use sha2::{Digest, Sha256};

const QR_VERSION: &str = "150";

/// 二维码生成器
pub struct QrBuilder<'a> {
    base_url: &'a str,
    csc_id: &'a str,
    csc_secret: &'a str,
}

impl<'a> QrBuilder<'a> {
    pub fn new(base_url: &'a str, csc_id: &'a str, csc_secret: &'a str) -> Self {
        Self {
            base_url,
            csc_id,
            csc_secret,
        }
    }

    /// 根据已签名的 `rDE` 生成 `dCarQR`
    pub fn build(&self, rde: &XmlElement) -> Result<String, SigningError> {
        let de = rde
            .child_by_name("DE")
            .ok_or_else(|| SigningError::MissingElement("DE".to_string()))?;
        let cdc = de
            .get_attr("Id")
            .ok_or_else(|| SigningError::MissingElement("DE/@Id".to_string()))?;
        let issued_at = required_text(de, "dFeEmiDE")?;
        let digest = required_text(rde, "DigestValue")?;
        let total = required_text(de, "dTotGralOpe")?;
        let total_iva = de
            .find("dTotIVA")
            .map(XmlElement::text)
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "0".to_string());

        let mut items = Vec::new();
        de.find_all("gCamItem", &mut items);

        let receiver = match de.find("dRucRec") {
            Some(ruc) => format!("dRucRec={}", ruc.text()),
            None => format!(
                "dNumIDRec={}",
                de.find("dNumIDRec").map(XmlElement::text).unwrap_or_default()
            ),
        };

        let params = format!(
            "nVersion={}&Id={}&dFeEmiDE={}&{}&dTotGralOpe={}&dTotIVA={}&cItems={}&DigestValue={}&IdCSC={}",
            QR_VERSION,
            cdc,
            hex::encode(issued_at.as_bytes()),
            receiver,
            total,
            total_iva,
            items.len(),
            hex::encode(digest.as_bytes()),
            self.csc_id,
        );

        Ok(format!(
            "{}{}&cHashQR={}",
            self.base_url,
            params,
            qr_hash(&params, self.csc_secret)
        ))
    }
}

/// `cHashQR`：参数串拼接 CSC 后的 SHA-256（小写十六进制）
pub fn qr_hash(params: &str, csc_secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(params.as_bytes());
    hasher.update(csc_secret.as_bytes());
    hex::encode(hasher.finalize())
}

fn required_text(element: &XmlElement, local: &str) -> Result<String, SigningError> {
    element
        .find(local)
        .map(XmlElement::text)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| SigningError::MissingElement(local.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::XmlDocument;

    const SIGNED: &str = r#"<rDE><dVerFor>150</dVerFor><DE Id="01800123457001001000004222024031511234567894"><gDatGralOpe><dFeEmiDE>2024-03-15T10:30:00</dFeEmiDE><gDatRec><dRucRec>80069563</dRucRec></gDatRec></gDatGralOpe><gDtipDE><gCamItem/><gCamItem/></gDtipDE><gTotSub><dTotGralOpe>160000</dTotGralOpe><dTotIVA>10000</dTotIVA></gTotSub></DE><Signature xmlns="http://www.w3.org/2000/09/xmldsig#"><SignedInfo><Reference><DigestValue>q1w2</DigestValue></Reference></SignedInfo></Signature></rDE>"#;

    const CSC: &str = "ABCD0000000000000000000000000000";

    #[test]
    fn test_qr_url_layout() {
        let doc = XmlDocument::parse(SIGNED).unwrap();
        let url = QrBuilder::new("https://ekuatia.set.gov.py/consultas-test/qr?", "0001", CSC)
            .build(&doc.root)
            .unwrap();

        let expected_params = format!(
            "nVersion=150&Id=01800123457001001000004222024031511234567894&dFeEmiDE={}&dRucRec=80069563&dTotGralOpe=160000&dTotIVA=10000&cItems=2&DigestValue={}&IdCSC=0001",
            hex::encode("2024-03-15T10:30:00"),
            hex::encode("q1w2"),
        );
        assert_eq!(
            url,
            format!(
                "https://ekuatia.set.gov.py/consultas-test/qr?{}&cHashQR={}",
                expected_params,
                qr_hash(&expected_params, CSC)
            )
        );
        assert!(!url.contains(CSC));
    }

    #[test]
    fn test_hash_depends_on_secret() {
        let a = qr_hash("nVersion=150", CSC);
        let b = qr_hash("nVersion=150", "EFGH0000000000000000000000000000");
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }

    #[test]
    fn test_missing_digest_is_error() {
        let doc = XmlDocument::parse(r#"<rDE><DE Id="1"><dFeEmiDE>x</dFeEmiDE></DE></rDE>"#)
            .unwrap();
        let err = QrBuilder::new("u?", "0001", CSC).build(&doc.root).unwrap_err();
        assert!(matches!(err, SigningError::MissingElement(_)));
    }
}
