/// SIFEN SOAP 客户端
///
/// 封装所有与 SIFEN Web 服务相关的调用逻辑（mTLS + SOAP 1.2）
use crate::clients::retry::{
    is_transient_error, is_transient_status, with_retry, Failure, RetryPolicy,
};
use crate::config::Config;
use crate::error::{AppResult, ConfigError, ConnectivityError};
use crate::models::response::{LotResponse, SendResponse};
use crate::services::packager::{query_envelope, request_id, PackagedLot};
use crate::services::response_parser::{parse_lot_response, parse_send_response};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Identity};
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

const SOAP_CONTENT_TYPE: &str = "application/soap+xml; charset=utf-8";

/// SIFEN 传输能力
///
/// 自动修复循环只依赖这个 trait，测试中可以用内存实现替换
#[async_trait]
pub trait SifenTransport: Send + Sync {
    /// 提交批次（`recibe-lote`）
    async fn send_lot(&self, lot: &PackagedLot) -> AppResult<SendResponse>;

    /// 查询批次状态（`consulta-lote`）
    async fn query_lot(&self, protocol: &str) -> AppResult<LotResponse>;
}

/// 基于 reqwest 的 SIFEN 客户端
pub struct SifenClient {
    http: Client,
    send_url: String,
    query_url: String,
    retry: RetryPolicy,
}

impl SifenClient {
    /// 创建新的 SIFEN 客户端（加载客户端证书）
    pub fn new(config: &Config) -> AppResult<Self> {
        config.validate_for_network()?;

        let mut pem = read_pem(&config.tls.cert_path)?;
        pem.push(b'\n');
        pem.extend(read_pem(&config.tls.key_path)?);
        let identity = Identity::from_pem(&pem).map_err(ConnectivityError::ClientBuild)?;

        let http = Client::builder()
            .use_rustls_tls()
            .identity(identity)
            .timeout(config.http.timeout())
            .build()
            .map_err(ConnectivityError::ClientBuild)?;

        Ok(Self {
            http,
            send_url: config.send_lot_url(),
            query_url: config.query_lot_url(),
            retry: RetryPolicy::from_config(&config.http),
        })
    }

    /// POST 一个 SOAP 信封，返回响应正文
    ///
    /// HTTP 500 仍然返回正文，由解析器识别 SOAP Fault
    async fn post(&self, url: &str, envelope: &str) -> AppResult<String> {
        debug!("POST {} ({} 字节)", url, envelope.len());

        let http = &self.http;
        let result = with_retry(&self.retry, url, move |_| async move {
            let response = http
                .post(url)
                .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
                .body(envelope.to_string())
                .send()
                .await
                .map_err(classify_transport)?;

            let status = response.status().as_u16();
            if is_transient_status(status) {
                return Err(Failure::Transient(PostError::Status(status)));
            }
            if !response.status().is_success() && status != 500 {
                return Err(Failure::Permanent(PostError::Status(status)));
            }
            response.text().await.map_err(classify_transport)
        })
        .await;

        result.map_err(|e| {
            let endpoint = url.to_string();
            match e.error {
                PostError::Transport(source) => ConnectivityError::RequestFailed {
                    endpoint,
                    attempts: e.attempts,
                    source,
                },
                PostError::Status(status) if is_transient_status(status) => {
                    ConnectivityError::Unavailable {
                        endpoint,
                        status,
                        attempts: e.attempts,
                    }
                }
                PostError::Status(status) => ConnectivityError::HttpStatus { endpoint, status },
            }
            .into()
        })
    }
}

#[async_trait]
impl SifenTransport for SifenClient {
    async fn send_lot(&self, lot: &PackagedLot) -> AppResult<SendResponse> {
        info!("📤 提交批次 dId={} ({} 个文档)", lot.request_id, lot.cdcs.len());
        let body = self.post(&self.send_url, &lot.envelope).await?;
        let response = parse_send_response(&body)?;
        info!("✓ 提交响应: {} {}", response.code, response.message);
        Ok(response)
    }

    async fn query_lot(&self, protocol: &str) -> AppResult<LotResponse> {
        debug!("查询批次 {}", protocol);
        let envelope = query_envelope(&request_id(), protocol)?;
        let body = self.post(&self.query_url, &envelope).await?;
        parse_lot_response(&body)
    }
}

#[derive(Debug)]
enum PostError {
    Transport(reqwest::Error),
    Status(u16),
}

impl fmt::Display for PostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PostError::Transport(e) => write!(f, "{}", e),
            PostError::Status(status) => write!(f, "HTTP {}", status),
        }
    }
}

fn classify_transport(err: reqwest::Error) -> Failure<PostError> {
    if is_transient_error(&err) {
        Failure::Transient(PostError::Transport(err))
    } else {
        Failure::Permanent(PostError::Transport(err))
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path).map_err(|source| ConfigError::ReadFailed {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;

    #[test]
    fn test_missing_certificate_is_config_error() {
        let mut config = Config::default();
        config.tls.cert_path = "/nonexistent/cert.pem".into();
        config.tls.key_path = "/nonexistent/key.pem".into();
        let err = SifenClient::new(&config).err().unwrap();
        assert!(matches!(err, AppError::Config(ConfigError::MissingFile { .. })));
    }

    #[test]
    fn test_invalid_pem_is_connectivity_error() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, "not a certificate").unwrap();
        std::fs::write(&key, "not a key").unwrap();

        let mut config = Config::default();
        config.tls.cert_path = cert;
        config.tls.key_path = key;
        let err = SifenClient::new(&config).err().unwrap();
        assert!(matches!(
            err,
            AppError::Connectivity(ConnectivityError::ClientBuild(_))
        ));
    }
}
