//! 自动修复运行器 - 编排层
//!
//! ## 职责
//!
//! 驱动"提交 → 查询 → 补丁 → 重新签名 → 重新提交"的循环，直到状态机给出终止结果。
//!
//! ## 核心功能
//!
//! 1. **签名**：未签名或打过补丁的文档在提交前重新签名
//! 2. **打包提交**：每轮生成新的 `lote.xml` 与 `dId`
//! 3. **轮询**：按 `poll_every` 间隔查询批次，最多 `max_poll` 次
//! 4. **补丁**：把 0160 消息交给 `XmlPatcher`
//! 5. **产物**：每一步都写入产物目录，任何结束方式都会写 `final_state.json`
//!
//! ## 设计特点
//!
//! - **决策在状态机**：本模块只执行 `Step`，不判断响应码
//! - **依赖 trait**：传输与签名通过 `SifenTransport` / `DocumentSigner` 注入

use crate::clients::SifenTransport;
use crate::config::{Config, PatchConfig};
use crate::error::{AppError, AppResult, ExitStatus};
use crate::services::artifact_store::{ArtifactKind, ArtifactStore};
use crate::services::packager;
use crate::services::patcher::XmlPatcher;
use crate::services::signer::{self, DocumentSigner};
use crate::utils::logging::{log_iteration_start, print_final_state};
use crate::workflow::autofix_machine::{AutofixMachine, Event, LoopLimits, Step, Terminal};
use crate::workflow::iteration_ctx::{AppliedPatch, FinalState, IterationCtx};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// 自动修复运行参数
#[derive(Debug, Clone)]
pub struct AutofixOptions {
    /// 初始 XML（`rDE` 或 `rLoteDE`）
    pub xml: PathBuf,
    pub limits: LoopLimits,
    pub poll_every: Duration,
}

impl AutofixOptions {
    pub fn from_config(config: &Config, xml: PathBuf) -> Self {
        Self {
            xml,
            limits: LoopLimits {
                max_iter: config.autofix.max_iter,
                max_poll: config.autofix.max_poll,
            },
            poll_every: config.poll_every(),
        }
    }
}

/// 运行结果
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub exit: ExitStatus,
    pub final_state: FinalState,
    /// `final_state.json` 路径（写入失败时为 None）
    pub final_state_path: Option<PathBuf>,
}

/// 自动修复运行器
///
/// 职责：
/// - 持有传输、签名器和产物目录
/// - 按状态机的指示执行每一步
/// - 不持有任何响应码判断逻辑
pub struct AutofixRunner<'a> {
    transport: &'a dyn SifenTransport,
    signer: &'a dyn DocumentSigner,
    store: ArtifactStore,
    patch: PatchConfig,
}

impl<'a> AutofixRunner<'a> {
    pub fn new(
        transport: &'a dyn SifenTransport,
        signer: &'a dyn DocumentSigner,
        store: ArtifactStore,
        patch: PatchConfig,
    ) -> Self {
        Self {
            transport,
            signer,
            store,
            patch,
        }
    }

    /// 使用配置中的产物目录与补丁规则创建运行器
    pub fn from_config(
        config: &Config,
        transport: &'a dyn SifenTransport,
        signer: &'a dyn DocumentSigner,
    ) -> Self {
        let store = ArtifactStore::new(&config.artifacts_dir, config.autofix.keep_last);
        Self::new(transport, signer, store, config.patch.clone())
    }

    /// 运行自动修复循环
    ///
    /// 不返回错误：所有错误都转换为退出状态并写入 `final_state.json`
    pub async fn run(&self, options: &AutofixOptions, ctx: &mut IterationCtx) -> RunOutcome {
        let (exit, final_state) = match self.drive(options, ctx).await {
            Ok(terminal) => {
                match &terminal {
                    Terminal::Success { .. } => info!("✅ {} 批次处理完成", ctx),
                    Terminal::BusinessBlocked { code, message } => {
                        warn!("⚠️ {} 业务阻断 {}: {}", ctx, code, message)
                    }
                    other => error!("❌ {} 结束: {}", ctx, other.label()),
                }
                (terminal.exit_status(), ctx.finish(&terminal))
            }
            Err(e) => {
                error!("❌ {} 运行失败: {}", ctx, e);
                let exit = e.exit_status();
                (exit, ctx.fail(exit.code(), &e))
            }
        };

        if let Err(e) = self.store.prune(ctx.iteration).await {
            warn!("清理旧产物失败: {}", e);
        }

        let final_state_path = match self.store.write_final_state(&final_state).await {
            Ok(path) => Some(path),
            Err(e) => {
                error!("❌ 无法写入最终状态: {}", e);
                None
            }
        };
        print_final_state(&final_state, final_state_path.as_deref());

        RunOutcome {
            exit,
            final_state,
            final_state_path,
        }
    }

    async fn drive(&self, options: &AutofixOptions, ctx: &mut IterationCtx) -> AppResult<Terminal> {
        let mut xml = read_xml(&options.xml).await?;
        let mut needs_signing = !signer::is_fully_signed(&xml)?;
        let mut machine = AutofixMachine::new(options.limits);

        loop {
            let iteration = machine.iteration();
            ctx.advance(iteration);
            log_iteration_start(ctx);

            if needs_signing {
                xml = self.signer.sign(&xml).await?;
                needs_signing = false;
            }

            let packaged = packager::package(&xml)?;
            ctx.current_xml = self
                .store
                .write_iteration(iteration, ArtifactKind::Sent, &packaged.lote_xml)
                .await?;
            xml = packaged.lote_xml.clone();

            let send = self.transport.send_lot(&packaged).await?;
            self.store
                .write_iteration_json(iteration, ArtifactKind::SendResponse, &send)
                .await?;
            let mut step = machine.apply(Event::Submitted(&send));
            ctx.last_send = Some(send);
            ctx.last_lot = None;

            loop {
                match step {
                    Step::Poll { protocol } => {
                        ctx.protocol = Some(protocol.clone());
                        sleep(options.poll_every).await;
                        ctx.polls += 1;

                        let lot = self.transport.query_lot(&protocol).await?;
                        self.store
                            .write_iteration_json(iteration, ArtifactKind::LotResponse, &lot)
                            .await?;
                        info!(
                            "{} 查询 {}/{}: {} {}",
                            ctx, ctx.polls, options.limits.max_poll, lot.code, lot.message
                        );
                        step = machine.apply(Event::Queried(&lot));
                        ctx.last_lot = Some(lot);
                    }
                    Step::Patch(discrepancy) => {
                        info!(
                            "🔧 {} 0160: 期望 <{}>，实际 <{}>",
                            ctx, discrepancy.expected, discrepancy.found
                        );
                        let (patched, report) =
                            XmlPatcher::new(&self.patch).patch_xml(&xml, &discrepancy)?;
                        let changed = report.changed();
                        if !changed {
                            warn!("⚠️ {} 补丁未改变文档，原样重新提交", ctx);
                        }
                        let output = self
                            .store
                            .write_iteration(iteration, ArtifactKind::Patched, &patched)
                            .await?;
                        ctx.patches.push(AppliedPatch {
                            iteration,
                            discrepancy,
                            report,
                            output: output.clone(),
                        });
                        ctx.current_xml = output;
                        if changed {
                            xml = patched;
                            needs_signing = true;
                        }
                        step = machine.apply(Event::Patched);
                    }
                    Step::Resend => {
                        if let Err(e) = self.store.prune(machine.iteration()).await {
                            warn!("清理旧产物失败: {}", e);
                        }
                        break;
                    }
                    Step::Finish(terminal) => return Ok(terminal),
                }
            }
        }
    }
}

async fn read_xml(path: &Path) -> AppResult<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| AppError::input_read_failed("输入 XML", path.display().to_string(), e))
}
