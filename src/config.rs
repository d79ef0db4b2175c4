//! 程序配置
//!
//! 配置只在进程启动时构造一次（TOML 文件 → 环境变量覆盖 → 命令行覆盖），
//! 之后以引用的形式向下传递，深层调用链中不再读取环境变量。

use crate::error::{AppError, AppResult, ConfigError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// SIFEN 环境
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// 测试环境
    #[default]
    Test,
    /// 生产环境
    Prod,
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "test" | "dev" => Ok(Environment::Test),
            "prod" | "production" => Ok(Environment::Prod),
            other => Err(ConfigError::Invalid {
                field: "environment".to_string(),
                reason: format!("未知环境 '{}'，可选 test / prod", other),
            }),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Test => write!(f, "test"),
            Environment::Prod => write!(f, "prod"),
        }
    }
}

/// 程序配置文件
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 当前环境
    pub environment: Environment,
    /// 产物目录
    pub artifacts_dir: PathBuf,
    /// 是否显示详细日志
    pub verbose_logging: bool,
    pub endpoints: EndpointsConfig,
    pub tls: TlsConfig,
    pub csc: CscConfig,
    pub signer: SignerConfig,
    pub http: HttpConfig,
    pub autofix: AutofixConfig,
    pub patch: PatchConfig,
}

/// 各环境的服务地址
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    pub test_base_url: String,
    pub prod_base_url: String,
    pub send_lot_path: String,
    pub query_lot_path: String,
    pub test_qr_url: String,
    pub prod_qr_url: String,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            test_base_url: "https://sifen-test.set.gov.py".to_string(),
            prod_base_url: "https://sifen.set.gov.py".to_string(),
            send_lot_path: "/de/ws/async/recibe-lote.wsdl".to_string(),
            query_lot_path: "/de/ws/consultas/consulta-lote.wsdl".to_string(),
            test_qr_url: "https://ekuatia.set.gov.py/consultas-test/qr?".to_string(),
            prod_qr_url: "https://ekuatia.set.gov.py/consultas/qr?".to_string(),
        }
    }
}

/// 客户端证书（PEM）
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// 纳税人安全码（CSC），只用于计算二维码哈希
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CscConfig {
    /// 4 位数字标识
    pub id: String,
    /// 32 位密钥
    pub secret: String,
}

impl fmt::Debug for CscConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CscConfig")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// 签名工具配置
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SignerConfig {
    /// xmlsec1 可执行文件
    pub xmlsec_bin: String,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            xmlsec_bin: "xmlsec1".to_string(),
        }
    }
}

/// HTTP 客户端配置
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    /// 瞬时网络错误的最大重试次数
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 8_000,
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// 自动修复循环配置
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AutofixConfig {
    pub max_iter: u32,
    pub poll_every_secs: u64,
    pub max_poll: u32,
    /// 保留最近几轮的产物（最终状态总是保留）
    pub keep_last: usize,
}

impl Default for AutofixConfig {
    fn default() -> Self {
        Self {
            max_iter: 5,
            poll_every_secs: 10,
            max_poll: 30,
            keep_last: 3,
        }
    }
}

/// XML 补丁配置
///
/// `totals_order` 来自实际拒绝案例的归纳，尚未经过完整验证，
/// 因此作为数据配置而不是写死在代码中。
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchConfig {
    /// 插入元素及补齐字段使用的值
    pub default_value: String,
    /// 合计字段组的父元素
    pub totals_parent: String,
    /// 合计字段的规范顺序
    pub totals_order: Vec<String>,
    /// 缺失时需要补 "0" 的合计字段
    pub totals_fill: Vec<String>,
}

impl Default for PatchConfig {
    fn default() -> Self {
        let order = [
            "dSubExe",
            "dSubExo",
            "dSub5",
            "dSub10",
            "dTotOpe",
            "dTotDesc",
            "dTotDescGlotem",
            "dTotAntItem",
            "dTotAnt",
            "dPorcDescTotal",
            "dDescTotal",
            "dAnticipo",
            "dRedon",
            "dComi",
            "dTotGralOpe",
            "dIVA5",
            "dIVA10",
            "dLiqTotIVA5",
            "dLiqTotIVA10",
            "dIVAComi",
            "dTotIVA",
            "dBaseGrav5",
            "dBaseGrav10",
            "dTBasGraIVA",
            "dTotalGs",
        ];
        let fill = [
            "dSubExe",
            "dSubExo",
            "dSub5",
            "dSub10",
            "dTotOpe",
            "dTotDesc",
            "dTotDescGlotem",
            "dTotAntItem",
            "dTotAnt",
            "dPorcDescTotal",
            "dDescTotal",
            "dAnticipo",
            "dRedon",
            "dTotGralOpe",
            "dIVA5",
            "dIVA10",
            "dTotIVA",
            "dBaseGrav5",
            "dBaseGrav10",
            "dTBasGraIVA",
        ];
        Self {
            default_value: "0".to_string(),
            totals_parent: "gTotSub".to_string(),
            totals_order: order.iter().map(|s| s.to_string()).collect(),
            totals_fill: fill.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Config {
    /// 从 TOML 文件加载，文件不存在时使用默认值
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let Some(path) = path else {
            return Ok(Self::default().with_fallback_dirs());
        };

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content, &path.display().to_string())
    }

    /// 从 TOML 字符串解析
    pub fn from_toml_str(content: &str, origin: &str) -> AppResult<Self> {
        let config: Config = toml::from_str(content).map_err(|source| ConfigError::ParseFailed {
            path: origin.to_string(),
            source,
        })?;
        Ok(config.with_fallback_dirs())
    }

    fn with_fallback_dirs(mut self) -> Self {
        if self.artifacts_dir.as_os_str().is_empty() {
            self.artifacts_dir = PathBuf::from("artifacts");
        }
        self
    }

    /// 使用环境变量覆盖配置
    ///
    /// 只应在 `main` 中调用一次
    pub fn apply_env_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> AppResult<Self> {
        if let Some(v) = lookup("SIFEN_ENV") {
            self.environment = v.parse()?;
        }
        if let Some(v) = lookup("SIFEN_CERT_PATH") {
            self.tls.cert_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("SIFEN_KEY_PATH") {
            self.tls.key_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("SIFEN_CSC") {
            self.csc.secret = v;
        }
        if let Some(v) = lookup("SIFEN_CSC_ID") {
            self.csc.id = v;
        }
        if let Some(v) = lookup("SIFEN_ARTIFACTS_DIR") {
            self.artifacts_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("SIFEN_MAX_ITER") {
            self.autofix.max_iter = v.parse().map_err(|_| ConfigError::EnvVarParseFailed {
                var_name: "SIFEN_MAX_ITER".to_string(),
                value: v.clone(),
                expected_type: "u32".to_string(),
            })?;
        }
        Ok(self)
    }

    /// 当前环境的服务基础地址
    pub fn base_url(&self) -> &str {
        match self.environment {
            Environment::Test => &self.endpoints.test_base_url,
            Environment::Prod => &self.endpoints.prod_base_url,
        }
    }

    pub fn send_lot_url(&self) -> String {
        format!("{}{}", self.base_url(), self.endpoints.send_lot_path)
    }

    pub fn query_lot_url(&self) -> String {
        format!("{}{}", self.base_url(), self.endpoints.query_lot_path)
    }

    /// 当前环境的二维码基础地址
    pub fn qr_base_url(&self) -> &str {
        match self.environment {
            Environment::Test => &self.endpoints.test_qr_url,
            Environment::Prod => &self.endpoints.prod_qr_url,
        }
    }

    pub fn poll_every(&self) -> Duration {
        Duration::from_secs(self.autofix.poll_every_secs)
    }

    /// 校验网络调用所需的配置（证书文件）
    pub fn validate_for_network(&self) -> AppResult<()> {
        require_file("客户端证书", &self.tls.cert_path)?;
        require_file("客户端私钥", &self.tls.key_path)?;
        if self.http.timeout_secs == 0 {
            return Err(AppError::invalid_config("http.timeout_secs", "必须大于 0"));
        }
        Ok(())
    }

    /// 校验签名所需的配置（证书 + CSC）
    pub fn validate_for_signing(&self) -> AppResult<()> {
        require_file("签名证书", &self.tls.cert_path)?;
        require_file("签名私钥", &self.tls.key_path)?;
        self.validate_csc()
    }

    /// CSC：32 位密钥 + 4 位数字标识
    pub fn validate_csc(&self) -> AppResult<()> {
        if self.csc.secret.chars().count() != 32 {
            return Err(AppError::invalid_config(
                "csc.secret",
                format!("长度必须为 32，当前为 {}", self.csc.secret.chars().count()),
            ));
        }
        if self.csc.id.len() != 4 || !self.csc.id.chars().all(|c| c.is_ascii_digit()) {
            return Err(AppError::invalid_config(
                "csc.id",
                format!("必须是 4 位数字，当前为 '{}'", self.csc.id),
            ));
        }
        Ok(())
    }
}

fn require_file(what: &str, path: &Path) -> AppResult<()> {
    if path.as_os_str().is_empty() || !path.is_file() {
        return Err(ConfigError::MissingFile {
            what: what.to_string(),
            path: path.display().to_string(),
        }
        .into());
    }
    Ok(())
}
