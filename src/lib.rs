//! # SIFEN Autofix
//!
//! 巴拉圭 SIFEN 电子发票客户端：构建、签名、打包、提交、查询，
//! 以及针对 0160（XML 结构错误）的自动修复循环
//!
//! ## 架构设计
//!
//! 本系统采用严格的四层架构：
//!
//! ### ① 基础设施层（Infrastructure / Clients）
//! - `infrastructure/` - 保留原始字节的 XML 树（签名后的内容不会被改写）
//! - `clients/` - mTLS SOAP 客户端与瞬时错误重试，通过 `SifenTransport` 暴露
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"，每个服务只做一件事
//! - `DeBuilder` - 构建 DE
//! - `XmlsecSigner` / `QrBuilder` - 签名与二维码
//! - `packager` - lote.xml → zip → base64 → SOAP 信封
//! - `response_parser` - 解析提交 / 查询响应
//! - `XmlPatcher` - 按 0160 消息插入元素、重排合计字段
//! - `ArtifactStore` - 写产物
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一次自动修复"的状态转移
//! - `AutofixMachine` - 纯状态机（Sent → Polling → Concluded）
//! - `IterationCtx` - 上下文封装（轮次 + 批次号 + 补丁记录）
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/commands` - 子命令（send / follow / autofix / build）
//! - `orchestrator/autofix_runner` - 执行状态机给出的每一步
//!
//! ## 模块结构

pub mod clients;
pub mod config;
pub mod error;
pub mod infrastructure;

pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use clients::{SifenClient, SifenTransport};
pub use config::{Config, Environment};
pub use error::{AppError, AppResult, ExitStatus};
pub use orchestrator::{AutofixOptions, AutofixRunner, RunOutcome};
pub use services::{DocumentSigner, XmlsecSigner};
pub use workflow::{AutofixMachine, FinalState, IterationCtx, LoopLimits, Terminal};
