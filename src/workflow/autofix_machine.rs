//! 0160 自动修复状态机 - 流程层
//!
//! 只包含纯状态转移，不做任何 I/O：
//! 输入是已解析的响应（或"补丁已完成"事件），输出是下一步动作。
//!
//! 状态：
//! - `Sent`：本轮批次已提交，等待提交响应
//! - `Polling`：批次处理中，按间隔查询
//! - `Concluded`：批次处理完成（等待补丁或已结束）
//! - `Fatal`：无法继续

use crate::error::ExitStatus;
use crate::models::response::{LotResponse, SendResponse};
use crate::models::status::CodeClass;
use crate::services::patcher::Discrepancy;
use tracing::warn;

/// 循环上限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopLimits {
    /// 最多提交几轮
    pub max_iter: u32,
    /// 每轮最多查询几次（超过后进入下一轮，不算失败）
    pub max_poll: u32,
}

/// 状态机阶段
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Sent,
    Polling { protocol: String, polls: u32 },
    Concluded,
    Fatal,
}

/// 终止结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    /// 批次完成且没有 0160
    Success {
        approved: usize,
        /// 因其他原因被拒绝的单据（不驱动补丁循环）
        rejected: Vec<String>,
    },
    /// 连接正常但业务被阻断（1264）
    BusinessBlocked { code: String, message: String },
    /// 无法识别的 0160 消息（原文返回给操作员）
    Unrecognized0160 { message: String },
    /// 批次被拒绝（0301）
    Rejected { code: String, message: String },
    /// 迭代次数耗尽
    MaxIterations,
    /// 其他无法继续的响应
    Fatal { code: String, message: String },
}

impl Terminal {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Terminal::Success { .. } | Terminal::BusinessBlocked { .. } => ExitStatus::Success,
            Terminal::Unrecognized0160 { .. } => ExitStatus::Unrecognized0160,
            Terminal::Rejected { .. } => ExitStatus::Rejected,
            Terminal::MaxIterations => ExitStatus::MaxIterations,
            Terminal::Fatal { .. } => ExitStatus::Internal,
        }
    }

    /// 写入最终状态的结果标签
    pub fn label(&self) -> &'static str {
        match self {
            Terminal::Success { .. } => "success",
            Terminal::BusinessBlocked { .. } => "business_blocked",
            Terminal::Unrecognized0160 { .. } => "unrecognized_0160",
            Terminal::Rejected { .. } => "rejected",
            Terminal::MaxIterations => "max_iterations",
            Terminal::Fatal { .. } => "fatal",
        }
    }

    /// 附加说明（业务阻断需要在输出中标注）
    pub fn annotation(&self) -> Option<&'static str> {
        match self {
            Terminal::BusinessBlocked { .. } => Some("business-blocked"),
            _ => None,
        }
    }
}

/// 下一步动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// 等待后查询批次
    Poll { protocol: String },
    /// 按差异打补丁，完成后发送 [`Event::Patched`]
    Patch(Discrepancy),
    /// 进入下一轮，重新提交
    Resend,
    /// 结束
    Finish(Terminal),
}

/// 状态机输入
#[derive(Debug, Clone, Copy)]
pub enum Event<'a> {
    Submitted(&'a SendResponse),
    Queried(&'a LotResponse),
    Patched,
}

/// 状态机快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineState {
    /// 当前轮次（从 1 开始）
    pub iteration: u32,
    pub phase: Phase,
}

impl MachineState {
    pub fn initial() -> Self {
        Self {
            iteration: 1,
            phase: Phase::Sent,
        }
    }
}

/// 纯状态转移
pub fn transition(
    state: &MachineState,
    event: Event<'_>,
    limits: &LoopLimits,
) -> (MachineState, Step) {
    match (&state.phase, event) {
        (Phase::Sent, Event::Submitted(resp)) => on_submitted(state, resp),
        (Phase::Polling { protocol, polls }, Event::Queried(resp)) => {
            on_queried(state, protocol, *polls, resp, limits)
        }
        (Phase::Concluded, Event::Patched) => next_iteration(state, limits),
        (phase, event) => fatal(
            state,
            "internal",
            format!("阶段 {:?} 不接受事件 {:?}", phase, event),
        ),
    }
}

fn on_submitted(state: &MachineState, resp: &SendResponse) -> (MachineState, Step) {
    match resp.class() {
        CodeClass::Accepted => match resp.protocol() {
            Some(protocol) => (
                MachineState {
                    iteration: state.iteration,
                    phase: Phase::Polling {
                        protocol: protocol.to_string(),
                        polls: 0,
                    },
                },
                Step::Poll {
                    protocol: protocol.to_string(),
                },
            ),
            None => fatal(
                state,
                &resp.code,
                "批次已接收但响应中没有 dProtConsLote".to_string(),
            ),
        },
        CodeClass::StructuralDefect => on_defect(state, &resp.message),
        CodeClass::BusinessBlocked => finish(
            state,
            Phase::Concluded,
            Terminal::BusinessBlocked {
                code: resp.code.clone(),
                message: resp.message.clone(),
            },
        ),
        CodeClass::Rejected => finish(
            state,
            Phase::Fatal,
            Terminal::Rejected {
                code: resp.code.clone(),
                message: resp.message.clone(),
            },
        ),
        _ => fatal(state, &resp.code, resp.message.clone()),
    }
}

fn on_queried(
    state: &MachineState,
    protocol: &str,
    polls: u32,
    resp: &LotResponse,
    limits: &LoopLimits,
) -> (MachineState, Step) {
    match resp.class() {
        CodeClass::Processing | CodeClass::Accepted => {
            let polls = polls + 1;
            if polls >= limits.max_poll {
                warn!("批次 {} 在 {} 次查询后仍在处理中，进入下一轮", protocol, polls);
                return next_iteration(state, limits);
            }
            (
                MachineState {
                    iteration: state.iteration,
                    phase: Phase::Polling {
                        protocol: protocol.to_string(),
                        polls,
                    },
                },
                Step::Poll {
                    protocol: protocol.to_string(),
                },
            )
        }
        CodeClass::Concluded => on_concluded(state, resp),
        CodeClass::BusinessBlocked => finish(
            state,
            Phase::Concluded,
            Terminal::BusinessBlocked {
                code: resp.code.clone(),
                message: resp.message.clone(),
            },
        ),
        _ => fatal(state, &resp.code, resp.message.clone()),
    }
}

fn on_concluded(state: &MachineState, resp: &LotResponse) -> (MachineState, Step) {
    if let Some(blocker) = resp.business_blocker() {
        return finish(
            state,
            Phase::Concluded,
            Terminal::BusinessBlocked {
                code: blocker.code.clone(),
                message: blocker.message.clone(),
            },
        );
    }

    if let Some(defect) = resp.malformed_xml() {
        return on_defect(state, &defect.message);
    }

    finish(
        state,
        Phase::Concluded,
        Terminal::Success {
            approved: resp.approved_count(),
            rejected: resp.rejected_cdcs(),
        },
    )
}

fn on_defect(state: &MachineState, message: &str) -> (MachineState, Step) {
    match Discrepancy::parse(message) {
        Some(discrepancy) => (
            MachineState {
                iteration: state.iteration,
                phase: Phase::Concluded,
            },
            Step::Patch(discrepancy),
        ),
        None => finish(
            state,
            Phase::Fatal,
            Terminal::Unrecognized0160 {
                message: message.to_string(),
            },
        ),
    }
}

fn next_iteration(state: &MachineState, limits: &LoopLimits) -> (MachineState, Step) {
    if state.iteration >= limits.max_iter {
        return finish(state, Phase::Fatal, Terminal::MaxIterations);
    }
    (
        MachineState {
            iteration: state.iteration + 1,
            phase: Phase::Sent,
        },
        Step::Resend,
    )
}

fn finish(state: &MachineState, phase: Phase, terminal: Terminal) -> (MachineState, Step) {
    (
        MachineState {
            iteration: state.iteration,
            phase,
        },
        Step::Finish(terminal),
    )
}

fn fatal(state: &MachineState, code: &str, message: String) -> (MachineState, Step) {
    finish(
        state,
        Phase::Fatal,
        Terminal::Fatal {
            code: code.to_string(),
            message,
        },
    )
}

/// 持有状态的包装，供运行器使用
#[derive(Debug, Clone)]
pub struct AutofixMachine {
    limits: LoopLimits,
    state: MachineState,
}

impl AutofixMachine {
    pub fn new(limits: LoopLimits) -> Self {
        Self {
            limits,
            state: MachineState::initial(),
        }
    }

    pub fn iteration(&self) -> u32 {
        self.state.iteration
    }

    pub fn phase(&self) -> &Phase {
        &self.state.phase
    }

    /// 输入事件，返回下一步动作
    pub fn apply(&mut self, event: Event<'_>) -> Step {
        let (next, step) = transition(&self.state, event, &self.limits);
        self.state = next;
        step
    }
}
