use crate::config::Config;
use crate::workflow::iteration_ctx::{FinalState, IterationCtx};
/// 日志工具模块
///
/// 提供日志初始化和横幅输出的辅助函数
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// 初始化日志
///
/// 优先使用 `RUST_LOG`，否则根据 `verbose` 选择 `debug` / `info`
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 记录程序启动信息
///
/// # 参数
/// - `command`: 子命令名称
/// - `config`: 生效的配置
pub fn log_startup(command: &str, config: &Config) {
    info!("{}", "=".repeat(60));
    info!("🚀 sifen {} - 环境: {}", command, config.environment);
    info!("🌐 服务地址: {}", config.base_url());
    info!("📁 产物目录: {}", config.artifacts_dir.display());
    info!("{}", "=".repeat(60));
}

/// 记录一轮开始
pub fn log_iteration_start(ctx: &IterationCtx) {
    info!("\n{}", "─".repeat(60));
    info!("📦 {} 开始提交: {}", ctx, ctx.current_xml.display());
    info!("{}", "─".repeat(60));
}

/// 打印最终状态
///
/// # 参数
/// - `state`: 最终状态
/// - `path`: `final_state.json` 路径（写入失败时为 None）
pub fn print_final_state(state: &FinalState, path: Option<&std::path::Path>) {
    info!("\n{}", "=".repeat(60));
    info!("📊 运行结束");
    info!("完成时间: {}", state.finished_at);
    info!("{}", "=".repeat(60));
    info!("结果: {} (退出码 {})", state.outcome, state.exit_code);
    if let Some(annotation) = &state.annotation {
        warn!("⚠️ {}", annotation);
    }
    info!("轮次: {}  补丁: {}", state.iterations, state.patches.len());
    if let Some(code) = &state.last_code {
        info!(
            "最后响应: {} {}",
            code,
            truncate_text(state.last_message.as_deref().unwrap_or(""), 120)
        );
    }
    if let Some(approved) = state.approved {
        info!("✅ 通过: {}", approved);
    }
    if !state.rejected_cdcs.is_empty() {
        info!("❌ 未通过: {}", state.rejected_cdcs.join(", "));
    }
    if let Some(error) = &state.error {
        info!("❌ 错误: {}", error);
    }
    info!("{}", "=".repeat(60));
    if let Some(path) = path {
        info!("\n最终状态已保存至: {}", path.display());
    }
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_text_counts_chars() {
        assert_eq!(truncate_text("Lote recibido", 4), "Lote...");
        assert_eq!(truncate_text("número", 6), "número");
        assert_eq!(truncate_text("número", 3), "núm...");
    }
}
