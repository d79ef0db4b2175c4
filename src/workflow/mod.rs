pub mod autofix_machine;
pub mod iteration_ctx;

pub use autofix_machine::{transition, AutofixMachine, Event, LoopLimits, Phase, Step, Terminal};
pub use iteration_ctx::{AppliedPatch, FinalState, IterationCtx};
