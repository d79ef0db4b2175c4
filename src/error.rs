use thiserror::Error;

/// 进程退出状态
///
/// 业务结果（成功、业务阻断）与技术故障使用不同的退出码，
/// 方便外部脚本区分
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// 成功（包括 1264 业务阻断）
    Success,
    /// 内部错误 / 无法解析的协议响应
    Internal,
    /// 网络连接错误
    Connectivity,
    /// 配置错误
    Config,
    /// 产物文件缺失
    ArtifactMissing,
    /// 补丁应用失败
    PatchFailed,
    /// 无法识别的 0160 消息
    Unrecognized0160,
    /// 迭代次数耗尽
    MaxIterations,
    /// 批次被拒绝
    Rejected,
}

impl ExitStatus {
    /// 获取退出码
    pub fn code(self) -> u8 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Internal => 1,
            ExitStatus::Connectivity => 2,
            ExitStatus::Config => 3,
            ExitStatus::ArtifactMissing => 4,
            ExitStatus::PatchFailed => 5,
            ExitStatus::Unrecognized0160 => 6,
            ExitStatus::MaxIterations => 7,
            ExitStatus::Rejected => 8,
        }
    }
}

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 网络连接错误
    #[error("连接错误: {0}")]
    Connectivity(#[from] ConnectivityError),
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// 产物文件错误
    #[error("产物错误: {0}")]
    Artifact(#[from] ArtifactError),
    /// XML 补丁错误
    #[error("补丁错误: {0}")]
    Patch(#[from] PatchError),
    /// SIFEN 协议错误
    #[error("协议错误: {0}")]
    Protocol(#[from] ProtocolError),
    /// XML 解析 / 序列化错误
    #[error("XML错误: {0}")]
    Xml(#[from] XmlError),
    /// 签名错误
    #[error("签名错误: {0}")]
    Signing(#[from] SigningError),
}

impl AppError {
    /// 错误对应的退出状态
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            AppError::Connectivity(_) => ExitStatus::Connectivity,
            AppError::Config(_) => ExitStatus::Config,
            AppError::Artifact(_) => ExitStatus::ArtifactMissing,
            AppError::Patch(_) => ExitStatus::PatchFailed,
            AppError::Protocol(_) | AppError::Xml(_) => ExitStatus::Internal,
            // 签名失败多半是证书或 xmlsec1 配置问题
            AppError::Signing(_) => ExitStatus::Config,
        }
    }
}

/// 网络连接错误
#[derive(Debug, Error)]
pub enum ConnectivityError {
    /// 请求失败（重试后仍失败）
    #[error("请求 {endpoint} 失败 (已尝试 {attempts} 次): {source}")]
    RequestFailed {
        endpoint: String,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
    /// 服务端暂时不可用（重试后仍为 502/503/504）
    #[error("服务端暂时不可用 ({endpoint}): HTTP {status}，已尝试 {attempts} 次")]
    Unavailable {
        endpoint: String,
        status: u16,
        attempts: u32,
    },
    /// 服务端拒绝请求（证书未授权等）
    #[error("服务端拒绝请求 ({endpoint}): HTTP {status}")]
    HttpStatus { endpoint: String, status: u16 },
    /// 构建 HTTP 客户端失败（TLS 身份等）
    #[error("无法构建 HTTP 客户端: {0}")]
    ClientBuild(#[source] reqwest::Error),
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 配置文件读取失败
    #[error("无法读取配置文件 {path}: {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 配置文件解析失败
    #[error("无法解析配置文件 {path}: {source}")]
    ParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    /// 环境变量解析失败
    #[error("环境变量 {var_name} 解析失败: 值 '{value}' 无法转换为 {expected_type}")]
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },
    /// 必需文件不存在
    #[error("{what} 不存在: {path}")]
    MissingFile { what: String, path: String },
    /// 字段取值非法
    #[error("配置项 {field} 非法: {reason}")]
    Invalid { field: String, reason: String },
}

/// 产物文件错误
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// 文件不存在
    #[error("文件不存在: {path}")]
    NotFound { path: String },
    /// 读取失败
    #[error("读取文件失败 ({path}): {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 写入失败
    #[error("写入文件失败 ({path}): {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// JSON 解析失败
    #[error("JSON解析失败 ({path}): {source}")]
    JsonParseFailed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    /// 产物缺少必要字段
    #[error("产物 {path} 缺少字段 {field}")]
    MissingField { path: String, field: String },
}

/// XML 补丁错误
#[derive(Debug, Error)]
pub enum PatchError {
    /// 找不到 "en lugar de" 指向的元素
    #[error("文档中找不到元素 <{element}>")]
    AnchorNotFound { element: String },
}

/// SIFEN 协议错误
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// SOAP Fault
    #[error("SOAP Fault: {code} {reason}")]
    SoapFault { code: String, reason: String },
    /// 响应缺少必需元素
    #[error("响应缺少元素 <{element}>")]
    MissingElement { element: String },
    /// 批次打包不符合规则
    #[error("批次非法: {0}")]
    InvalidLot(String),
    /// CDC 格式错误
    #[error("CDC 非法: {0}")]
    InvalidCdc(String),
    /// 压缩批次失败
    #[error("压缩 lote.xml 失败: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// XML 错误
#[derive(Debug, Error)]
pub enum XmlError {
    /// 底层解析错误
    #[error("解析失败: {0}")]
    Parse(#[from] quick_xml::Error),
    /// 结构错误（标签不匹配、缺少根元素等）
    #[error("结构错误: {0}")]
    Malformed(String),
    /// 序列化结果不是 UTF-8
    #[error("序列化结果不是合法 UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

impl From<std::io::Error> for XmlError {
    fn from(err: std::io::Error) -> Self {
        XmlError::Parse(quick_xml::Error::from(err))
    }
}

impl From<quick_xml::events::attributes::AttrError> for XmlError {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        XmlError::Parse(quick_xml::Error::from(err))
    }
}

/// 签名错误
#[derive(Debug, Error)]
pub enum SigningError {
    /// 无法启动签名程序
    #[error("无法启动 {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// 签名程序返回失败
    #[error("{program} 退出码 {status}: {stderr}")]
    ToolFailed {
        program: String,
        status: i32,
        stderr: String,
    },
    /// 临时文件读写失败
    #[error("临时文件错误: {0}")]
    TempFile(#[from] std::io::Error),
    /// 文档缺少签名所需的元素
    #[error("文档缺少 <{0}>")]
    MissingElement(String),
    /// 输入或签名输出无法解析
    #[error("XML错误: {0}")]
    Xml(#[from] XmlError),
}

// ========== 便捷构造函数 ==========

impl AppError {
    /// 创建产物读取错误
    pub fn artifact_read_failed(path: impl Into<String>, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            return AppError::Artifact(ArtifactError::NotFound { path: path.into() });
        }
        AppError::Artifact(ArtifactError::ReadFailed {
            path: path.into(),
            source,
        })
    }

    /// 创建输入文件读取错误
    ///
    /// 用户指定的输入不存在属于配置错误，其他读取失败仍按产物错误处理
    pub fn input_read_failed(
        what: impl Into<String>,
        path: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            return AppError::Config(ConfigError::MissingFile {
                what: what.into(),
                path: path.into(),
            });
        }
        Self::artifact_read_failed(path, source)
    }

    /// 创建产物写入错误
    pub fn artifact_write_failed(path: impl Into<String>, source: std::io::Error) -> Self {
        AppError::Artifact(ArtifactError::WriteFailed {
            path: path.into(),
            source,
        })
    }

    /// 创建配置项非法错误
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        AppError::Config(ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        })
    }

    /// 创建响应缺少元素错误
    pub fn missing_element(element: impl Into<String>) -> Self {
        AppError::Protocol(ProtocolError::MissingElement {
            element: element.into(),
        })
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let all = [
            ExitStatus::Success,
            ExitStatus::Internal,
            ExitStatus::Connectivity,
            ExitStatus::Config,
            ExitStatus::ArtifactMissing,
            ExitStatus::PatchFailed,
            ExitStatus::Unrecognized0160,
            ExitStatus::MaxIterations,
            ExitStatus::Rejected,
        ];
        let mut codes: Vec<u8> = all.iter().map(|s| s.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
        assert_eq!(ExitStatus::Success.code(), 0);
    }

    #[test]
    fn test_missing_artifact_maps_to_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = AppError::artifact_read_failed("x.json", io);
        assert!(matches!(
            err,
            AppError::Artifact(ArtifactError::NotFound { .. })
        ));
        assert_eq!(err.exit_status(), ExitStatus::ArtifactMissing);
    }

    #[test]
    fn test_missing_input_is_config_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = AppError::input_read_failed("输入 XML", "de.xml", io);
        assert!(matches!(err, AppError::Config(ConfigError::MissingFile { .. })));
        assert_eq!(err.exit_status(), ExitStatus::Config);

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = AppError::input_read_failed("输入 XML", "de.xml", io);
        assert_eq!(err.exit_status(), ExitStatus::ArtifactMissing);
    }
}
