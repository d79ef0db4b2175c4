//! 发票描述加载
//!
//! 单个文件加载时做完整校验；文件夹加载按文件名排序，
//! 无效文件和重复的单据号只记录警告并跳过。

use crate::error::AppError;
use crate::models::invoice::InvoiceInput;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

/// 从 TOML 文件加载发票描述并校验
pub async fn load_invoice(path: &Path) -> Result<InvoiceInput> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("无法读取发票描述: {}", path.display()))?;

    let mut invoice: InvoiceInput = toml::from_str(&content)
        .with_context(|| format!("无法解析发票描述: {}", path.display()))?;

    let problems = invoice.problems();
    if !problems.is_empty() {
        return Err(AppError::invalid_config(
            path.display().to_string(),
            format!("发票描述无效:\n  - {}", problems.join("\n  - ")),
        )
        .into());
    }

    invoice.file_path = Some(path.to_string_lossy().to_string());
    Ok(invoice)
}

/// 单据在开票方内的唯一编号：RUC-establishment-expedition_point-document_number
fn document_key(invoice: &InvoiceInput) -> String {
    let pad = |value: &str, width: usize| format!("{:0>width$}", value.trim(), width = width);
    format!(
        "{}-{}-{}-{}",
        invoice.issuer.ruc.trim(),
        pad(&invoice.stamp.establishment, 3),
        pad(&invoice.stamp.expedition_point, 3),
        pad(&invoice.stamp.document_number, 7)
    )
}

/// 加载文件夹中的所有 `.toml` 发票描述
///
/// 无效文件跳过；单据号与前面的文件重复时跳过后出现的文件
pub async fn load_all_invoices(folder: &Path) -> Result<Vec<InvoiceInput>> {
    if !folder.is_dir() {
        anyhow::bail!("文件夹不存在: {}", folder.display());
    }

    let mut paths: Vec<PathBuf> = Vec::new();
    let mut entries = fs::read_dir(folder)
        .await
        .with_context(|| format!("无法读取文件夹: {}", folder.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut invoices = Vec::new();
    let mut seen: HashMap<String, PathBuf> = HashMap::new();
    let mut skipped = 0;

    for path in &paths {
        let invoice = match load_invoice(path).await {
            Ok(invoice) => invoice,
            Err(e) => {
                warn!("⚠️ 跳过 {}: {:#}", path.display(), e);
                skipped += 1;
                continue;
            }
        };

        let key = document_key(&invoice);
        if let Some(first) = seen.get(&key) {
            warn!(
                "⚠️ 跳过 {}: 单据号 {} 与 {} 重复",
                path.display(),
                key,
                first.display()
            );
            skipped += 1;
            continue;
        }
        seen.insert(key, path.clone());
        invoices.push(invoice);
    }

    info!(
        "✓ 加载发票描述 {}/{} 个（跳过 {} 个）",
        invoices.len(),
        paths.len(),
        skipped
    );
    Ok(invoices)
}
