//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责把子命令翻译成对下层的调用，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `commands` - 子命令
//! - `send`：签名（如需要）→ 打包 → 提交一次
//! - `follow`：读取提交响应，查询批次状态
//! - `autofix`：创建客户端与签名器，交给 `AutofixRunner`
//! - `build`：根据发票描述构建 DE
//!
//! ### `autofix_runner` - 自动修复运行器
//! - 驱动 `AutofixMachine`，执行它给出的每一步
//! - 持有产物目录，每一步写入产物
//! - 任何结束方式都写 `final_state.json`
//!
//! ## 层次关系
//!
//! ```text
//! commands (子命令)
//!     ↓
//! autofix_runner (循环执行)
//!     ↓
//! workflow::AutofixMachine (纯状态转移)
//!     ↓
//! services (能力层：packager / patcher / signer / artifact_store)
//!     ↓
//! clients + infrastructure (SIFEN SOAP 客户端、XML 树)
//! ```
//!
//! ## 设计原则
//!
//! 1. **单一职责**：commands 管配置与资源，autofix_runner 管循环
//! 2. **资源隔离**：只有编排层创建 HTTP 客户端和签名器
//! 3. **向下依赖**：编排层 → workflow → services → clients / infrastructure
//! 4. **无业务逻辑**：响应码判断全部在 workflow 中

pub mod autofix_runner;
pub mod commands;

// 重新导出主要类型
pub use autofix_runner::{AutofixOptions, AutofixRunner, RunOutcome};
pub use commands::exit_status_of;
