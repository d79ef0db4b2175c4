//! 子命令实现 - 编排层
//!
//! 每个子命令负责：校验配置 → 创建客户端 / 签名器 → 调用下层 → 写产物 → 返回退出状态。
//! 错误以 `anyhow::Error` 返回，`main` 通过 [`exit_status_of`] 取得退出码。

use crate::clients::{SifenClient, SifenTransport};
use crate::config::Config;
use crate::error::{AppError, ArtifactError, ConfigError, ExitStatus};
use crate::models::{load_all_invoices, load_invoice, InvoiceInput};
use crate::models::response::{LotResponse, SendResponse};
use crate::models::status::CodeClass;
use crate::orchestrator::autofix_runner::{AutofixOptions, AutofixRunner};
use crate::services::artifact_store::{read_json, ArtifactStore};
use crate::services::de_builder::DeBuilder;
use crate::services::packager;
use crate::services::signer::{self, DocumentSigner, XmlsecSigner};
use crate::utils::logging::{log_startup, print_final_state, truncate_text};
use crate::workflow::iteration_ctx::IterationCtx;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::time::sleep;
use tracing::{error, info, warn};

/// `send` 写入的批次文件
pub const SENT_LOTE_FILE: &str = "sent_lote.xml";
/// `send` 写入的提交响应
pub const SEND_RESPONSE_FILE: &str = "send_response.json";
/// `follow` 写入的查询响应
pub const LOT_RESPONSE_FILE: &str = "lot_response.json";

/// 从错误链中找到 [`AppError`] 并返回对应的退出状态
pub fn exit_status_of(err: &anyhow::Error) -> ExitStatus {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<AppError>())
        .map(AppError::exit_status)
        .unwrap_or(ExitStatus::Internal)
}

/// 提交一个批次
pub async fn send(config: &Config, xml_path: &Path) -> Result<ExitStatus> {
    log_startup("send", config);
    let client = SifenClient::new(config)?;
    let store = ArtifactStore::new(&config.artifacts_dir, 0);

    let mut xml = read_xml(xml_path).await?;
    if !signer::is_fully_signed(&xml).map_err(AppError::from)? {
        config.validate_for_signing()?;
        xml = XmlsecSigner::new(config)
            .sign(&xml)
            .await
            .map_err(AppError::from)?;
    }

    let packaged = packager::package(&xml)?;
    store.write_text(SENT_LOTE_FILE, &packaged.lote_xml).await?;

    let response = client.send_lot(&packaged).await?;
    let path = store.write_json(SEND_RESPONSE_FILE, &response).await?;
    info!("💾 提交响应已保存: {}", path.display());

    Ok(send_exit_status(&response))
}

/// 提交响应对应的退出状态
pub fn send_exit_status(response: &SendResponse) -> ExitStatus {
    match response.class() {
        CodeClass::Accepted => {
            info!("✓ 批次已接收，批次号: {}", response.protocol().unwrap_or("-"));
            ExitStatus::Success
        }
        CodeClass::BusinessBlocked => {
            warn!("⚠️ business-blocked {}: {}", response.code, response.message);
            ExitStatus::Success
        }
        CodeClass::Rejected | CodeClass::StructuralDefect => {
            error!("❌ 批次被拒绝 {}: {}", response.code, response.message);
            ExitStatus::Rejected
        }
        _ => {
            error!("❌ 无法处理的响应 {}: {}", response.code, response.message);
            ExitStatus::Internal
        }
    }
}

/// 查询批次状态
///
/// `once` 指定提交响应文件时只查询一次；否则读取产物目录中的
/// `send_response.json`，最多查询 `max_poll` 次直到批次不再处理中。
pub async fn follow(config: &Config, once: Option<&Path>) -> Result<ExitStatus> {
    log_startup("follow", config);
    let store = ArtifactStore::new(&config.artifacts_dir, 0);

    let response_path = once
        .map(Path::to_path_buf)
        .unwrap_or_else(|| store.path(SEND_RESPONSE_FILE));
    let send: SendResponse = read_json(&response_path).await?;
    let protocol = send
        .protocol()
        .ok_or_else(|| {
            AppError::from(ArtifactError::MissingField {
                path: response_path.display().to_string(),
                field: "protocol".to_string(),
            })
        })?
        .to_string();

    let client = SifenClient::new(config)?;
    let max_poll = if once.is_some() {
        1
    } else {
        config.autofix.max_poll.max(1)
    };

    let mut polls = 0;
    loop {
        polls += 1;
        let lot = client.query_lot(&protocol).await?;
        let path = store.write_json(LOT_RESPONSE_FILE, &lot).await?;
        info!(
            "[批次#{}] 查询 {}/{}: {} {}",
            protocol, polls, max_poll, lot.code, lot.message
        );

        if lot.class() != CodeClass::Processing || polls >= max_poll {
            info!("💾 查询响应已保存: {}", path.display());
            return Ok(follow_exit_status(&lot));
        }
        sleep(config.poll_every()).await;
    }
}

/// 查询响应对应的退出状态
pub fn follow_exit_status(lot: &LotResponse) -> ExitStatus {
    match lot.class() {
        CodeClass::Processing | CodeClass::Accepted => {
            info!("⏳ 批次仍在处理中");
            ExitStatus::Success
        }
        CodeClass::Concluded => {
            if let Some(blocker) = lot.business_blocker() {
                warn!("⚠️ business-blocked {}: {}", blocker.code, blocker.message);
            } else if let Some(defect) = lot.malformed_xml() {
                warn!(
                    "⚠️ 0160: {}（使用 autofix 修复）",
                    truncate_text(&defect.message, 200)
                );
            }
            info!(
                "✓ 批次处理完成: 通过 {}/{}",
                lot.approved_count(),
                lot.documents.len()
            );
            ExitStatus::Success
        }
        CodeClass::BusinessBlocked => {
            warn!("⚠️ business-blocked {}: {}", lot.code, lot.message);
            ExitStatus::Success
        }
        CodeClass::Rejected => {
            error!("❌ 批次被拒绝 {}: {}", lot.code, lot.message);
            ExitStatus::Rejected
        }
        _ => {
            error!("❌ 无法处理的响应 {}: {}", lot.code, lot.message);
            ExitStatus::Internal
        }
    }
}

/// 运行自动修复循环
///
/// 客户端或签名配置无效时同样写入 `final_state.json`
pub async fn autofix(config: &Config, xml_path: PathBuf) -> Result<ExitStatus> {
    log_startup("autofix", config);
    let options = AutofixOptions::from_config(config, xml_path.clone());
    let mut ctx = IterationCtx::new(config.environment, options.limits.max_iter, xml_path);

    let client = match validate_limits(&options)
        .and_then(|_| config.validate_for_signing())
        .and_then(|_| SifenClient::new(config))
    {
        Ok(client) => client,
        Err(e) => {
            error!("❌ 初始化失败: {}", e);
            let state = ctx.fail(e.exit_status().code(), &e);
            let store = ArtifactStore::new(&config.artifacts_dir, 0);
            let path = store.write_final_state(&state).await.ok();
            print_final_state(&state, path.as_deref());
            return Ok(e.exit_status());
        }
    };
    let signer = XmlsecSigner::new(config);

    let outcome = AutofixRunner::from_config(config, &client as &dyn SifenTransport, &signer)
        .run(&options, &mut ctx)
        .await;
    Ok(outcome.exit)
}

/// 根据发票描述构建 DE（可选签名）
///
/// `invoice_path` 为文件夹时构建其中所有 `.toml`，输出到 `out/<CDC>.xml`
pub async fn build(config: &Config, invoice_path: &Path, out: &Path, sign: bool) -> Result<ExitStatus> {
    if sign {
        config.validate_for_signing()?;
    }
    let signer = sign.then(|| XmlsecSigner::new(config));

    if invoice_path.is_dir() {
        let invoices = load_all_invoices(invoice_path).await?;
        if invoices.is_empty() {
            warn!("⚠️ 没有找到发票描述文件: {}", invoice_path.display());
            return Ok(ExitStatus::Success);
        }
        info!("✓ 找到 {} 个发票描述", invoices.len());
        for invoice in &invoices {
            let (cdc, xml) = build_one(invoice, signer.as_ref()).await?;
            write_document(&out.join(format!("{}.xml", cdc)), xml).await?;
        }
        return Ok(ExitStatus::Success);
    }

    if !invoice_path.is_file() {
        return Err(AppError::from(ConfigError::MissingFile {
            what: "发票描述".to_string(),
            path: invoice_path.display().to_string(),
        })
        .into());
    }
    let invoice = load_invoice(invoice_path).await?;
    let (_, xml) = build_one(&invoice, signer.as_ref()).await?;
    write_document(out, xml).await?;
    Ok(ExitStatus::Success)
}

async fn build_one(
    invoice: &InvoiceInput,
    signer: Option<&XmlsecSigner>,
) -> Result<(String, String), AppError> {
    let built = DeBuilder::new().build(invoice)?;
    info!("✓ DE 已构建: CDC {}", built.cdc);
    info!(
        "合计: {} (IVA {})",
        built.totals.total_operation(),
        built.totals.total_iva()
    );

    let mut xml = built.document.to_xml_string()?;
    if let Some(signer) = signer {
        xml = signer.sign(&xml).await?;
    }
    Ok((built.cdc.to_string(), xml))
}

async fn write_document(out: &Path, xml: String) -> Result<()> {
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| AppError::artifact_write_failed(parent.display().to_string(), e))?;
    }
    tokio::fs::write(out, xml)
        .await
        .map_err(|e| AppError::artifact_write_failed(out.display().to_string(), e))
        .with_context(|| format!("无法写入 DE: {}", out.display()))?;
    info!("💾 DE 已保存: {}", out.display());
    Ok(())
}

fn validate_limits(options: &AutofixOptions) -> Result<(), AppError> {
    if options.limits.max_iter == 0 {
        return Err(AppError::invalid_config("autofix.max_iter", "必须大于 0"));
    }
    if options.limits.max_poll == 0 {
        return Err(AppError::invalid_config("autofix.max_poll", "必须大于 0"));
    }
    Ok(())
}

async fn read_xml(path: &Path) -> Result<String, AppError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| AppError::input_read_failed("输入 XML", path.display().to_string(), e))
}
