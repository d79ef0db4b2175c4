//! 自动修复运行上下文
//!
//! 封装"我正在处理第几轮、批次号是什么、之前打过哪些补丁"这一信息，
//! 结束时转换为 `final_state.json`

use crate::config::Environment;
use crate::models::response::{LotResponse, SendResponse};
use crate::services::patcher::{Discrepancy, PatchReport};
use crate::workflow::autofix_machine::Terminal;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::PathBuf;

/// 自动修复运行上下文
#[derive(Debug, Clone)]
pub struct IterationCtx {
    /// 当前轮次（从 1 开始）
    pub iteration: u32,

    /// 最大轮次（仅用于日志显示）
    pub max_iter: u32,

    pub environment: Environment,

    /// 当前轮次的批次号
    pub protocol: Option<String>,

    /// 当前轮次已查询次数
    pub polls: u32,

    /// 当前使用的 XML 文件
    pub current_xml: PathBuf,

    pub last_send: Option<SendResponse>,
    pub last_lot: Option<LotResponse>,

    /// 每轮应用过的补丁
    pub patches: Vec<AppliedPatch>,
}

/// 一次补丁记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedPatch {
    pub iteration: u32,
    pub discrepancy: Discrepancy,
    pub report: PatchReport,
    pub output: PathBuf,
}

impl IterationCtx {
    /// 创建新的运行上下文
    pub fn new(environment: Environment, max_iter: u32, xml: PathBuf) -> Self {
        Self {
            iteration: 1,
            max_iter,
            environment,
            protocol: None,
            polls: 0,
            current_xml: xml,
            last_send: None,
            last_lot: None,
            patches: Vec::new(),
        }
    }

    /// 开始新的一轮
    pub fn advance(&mut self, iteration: u32) {
        self.iteration = iteration;
        self.protocol = None;
        self.polls = 0;
    }

    /// 最终状态（正常结束）
    pub fn finish(&self, terminal: &Terminal) -> FinalState {
        let mut state = self.base_state(terminal.label(), terminal.exit_status().code());
        state.annotation = terminal.annotation().map(str::to_string);
        match terminal {
            Terminal::Success { approved, rejected } => {
                state.approved = Some(*approved);
                state.rejected_cdcs = rejected.clone();
            }
            Terminal::BusinessBlocked { code, message }
            | Terminal::Rejected { code, message }
            | Terminal::Fatal { code, message } => {
                state.last_code = Some(code.clone());
                state.last_message = Some(message.clone());
            }
            Terminal::Unrecognized0160 { message } => {
                state.last_code = Some("0160".to_string());
                state.last_message = Some(message.clone());
            }
            Terminal::MaxIterations => {}
        }
        state
    }

    /// 最终状态（运行出错）
    pub fn fail(&self, exit_code: u8, error: &dyn std::error::Error) -> FinalState {
        let mut state = self.base_state("error", exit_code);
        state.error = Some(error.to_string());
        state
    }

    fn base_state(&self, outcome: &str, exit_code: u8) -> FinalState {
        let (last_code, last_message) = match (&self.last_lot, &self.last_send) {
            (Some(lot), _) => (Some(lot.code.clone()), Some(lot.message.clone())),
            (None, Some(send)) => (Some(send.code.clone()), Some(send.message.clone())),
            (None, None) => (None, None),
        };
        FinalState {
            outcome: outcome.to_string(),
            exit_code,
            annotation: None,
            environment: self.environment,
            iterations: self.iteration,
            protocol: self.protocol.clone(),
            last_code,
            last_message,
            approved: None,
            rejected_cdcs: Vec::new(),
            last_xml: self.current_xml.clone(),
            patches: self.patches.clone(),
            error: None,
            finished_at: chrono::Local::now().to_rfc3339(),
        }
    }
}

impl Display for IterationCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[第 {}/{} 轮", self.iteration, self.max_iter)?;
        if let Some(protocol) = &self.protocol {
            write!(f, " 批次#{}", protocol)?;
        }
        write!(f, "]")
    }
}

/// `final_state.json` 内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalState {
    /// 结果标签（success / business_blocked / max_iterations / error ...）
    pub outcome: String,
    pub exit_code: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
    pub environment: Environment,
    /// 已执行的轮次
    pub iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected_cdcs: Vec<String>,
    /// 最后一次使用的 XML
    pub last_xml: PathBuf,
    #[serde(default)]
    pub patches: Vec<AppliedPatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_protocol() {
        let mut ctx = IterationCtx::new(Environment::Test, 5, PathBuf::from("de.xml"));
        assert_eq!(ctx.to_string(), "[第 1/5 轮]");
        ctx.protocol = Some("123".to_string());
        assert_eq!(ctx.to_string(), "[第 1/5 轮 批次#123]");

        ctx.advance(2);
        assert_eq!(ctx.to_string(), "[第 2/5 轮]");
    }

    #[test]
    fn test_business_blocked_state_is_annotated() {
        let ctx = IterationCtx::new(Environment::Test, 5, PathBuf::from("de.xml"));
        let state = ctx.finish(&Terminal::BusinessBlocked {
            code: "1264".to_string(),
            message: "RUC no habilitado".to_string(),
        });
        assert_eq!(state.exit_code, 0);
        assert_eq!(state.annotation.as_deref(), Some("business-blocked"));
        assert_eq!(state.last_code.as_deref(), Some("1264"));

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["outcome"], "business_blocked");
        assert_eq!(json["annotation"], "business-blocked");
    }

    #[test]
    fn test_failure_state_records_error() {
        let ctx = IterationCtx::new(Environment::Prod, 5, PathBuf::from("de.xml"));
        let err = std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout");
        let state = ctx.fail(2, &err);
        assert_eq!(state.outcome, "error");
        assert_eq!(state.exit_code, 2);
        assert_eq!(state.error.as_deref(), Some("timeout"));
    }
}
