//! Per thread stepping engine.
//!
//! Engine is a pure state machine: it looks at a stopped thread through [`StepTarget`] and
//! tells the owner what to do next with a [`StepAction`]. The owner executes an action,
//! waits for the next stop and feeds it back into the engine until [`StepAction::Done`].

use crate::debugger::address::TargetAddress;
use crate::debugger::arch::{CallTarget, Instruction};
use crate::debugger::error::Error;
use crate::debugger::runtime::Trampoline;
use log::debug;

/// What to do with calls met during a range step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallPolicy {
    /// Step into a callee if it is steppable.
    Follow,
    /// Run callee until it returns.
    Skip,
}

/// Code range the thread steps through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StepFrame {
    pub start: TargetAddress,
    pub end: TargetAddress,
    pub calls: CallPolicy,
}

impl StepFrame {
    pub fn new(start: TargetAddress, end: TargetAddress, calls: CallPolicy) -> Self {
        Self { start, end, calls }
    }

    pub fn contains(&self, addr: TargetAddress) -> bool {
        addr.in_range(self.start, self.end)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepCommand {
    /// Execute one instruction, calls are followed.
    Instruction,
    /// Execute one instruction, calls are executed entirely.
    NextInstruction,
    /// Step while program counter stays inside a frame.
    Range(StepFrame),
    /// Run until the current function returns.
    Finish,
    /// Plain continue.
    Continue,
}

/// Stopped thread as seen by a stepping engine.
pub trait StepTarget {
    fn pc(&mut self) -> Result<TargetAddress, Error>;

    fn sp(&mut self) -> Result<u64, Error>;

    fn instruction(&mut self, addr: TargetAddress) -> Result<Instruction, Error>;

    /// Return address of the current function.
    fn return_address(&mut self) -> Result<TargetAddress, Error>;

    fn is_steppable(&self, addr: TargetAddress) -> bool;

    fn trampoline(&mut self, target: TargetAddress) -> Option<Trampoline>;
}

/// Next action requested by an engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepAction {
    /// Single step a thread.
    Step,
    /// Continue a thread until a temporary trap at address.
    RunTo(TargetAddress),
    /// Continue a thread without a temporary trap.
    Resume,
    /// Compile a method with a nested invocation, pass result into
    /// [`SteppingEngine::on_compiled`].
    Compile(Trampoline),
    /// Step finished.
    Done,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Stepping,
    /// Single step into an indirect call made, check where a thread lands.
    Landing { return_address: TargetAddress, sp: u64 },
    /// Running until a thread returns to `address` with a stack pointer at least `sp`.
    RunToReturn { address: TargetAddress, sp: u64 },
    /// Running until a compiled method entry.
    RunToCode { address: TargetAddress },
    Compiling { return_address: TargetAddress, sp: u64 },
}

#[derive(Debug)]
pub struct SteppingEngine {
    command: Option<StepCommand>,
    phase: Phase,
}

impl Default for SteppingEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SteppingEngine {
    pub fn new() -> Self {
        Self {
            command: None,
            phase: Phase::Idle,
        }
    }

    pub fn is_active(&self) -> bool {
        self.command.is_some()
    }

    pub fn command(&self) -> Option<StepCommand> {
        self.command
    }

    /// Current step frame, `None` between steps.
    pub fn frame(&self) -> Option<StepFrame> {
        match self.command {
            Some(StepCommand::Range(frame)) => Some(frame),
            _ => None,
        }
    }

    /// Thread is waiting for a compile invocation.
    pub fn is_compiling(&self) -> bool {
        matches!(self.phase, Phase::Compiling { .. })
    }

    /// Drop current step.
    pub fn abort(&mut self) {
        if let Some(command) = self.command.take() {
            debug!(target: "debugger", "step {command:?} aborted");
        }
        self.phase = Phase::Idle;
    }

    fn done(&mut self) -> StepAction {
        self.command = None;
        self.phase = Phase::Idle;
        StepAction::Done
    }

    fn run_to_return(&mut self, address: TargetAddress, sp: u64) -> StepAction {
        self.phase = Phase::RunToReturn { address, sp };
        StepAction::RunTo(address)
    }

    /// Start a new step.
    pub fn start(
        &mut self,
        command: StepCommand,
        target: &mut dyn StepTarget,
    ) -> Result<StepAction, Error> {
        self.abort();
        debug!(target: "debugger", "start step {command:?}");

        let action = match command {
            StepCommand::Continue => return Ok(StepAction::Resume),
            StepCommand::Instruction => {
                self.command = Some(command);
                self.phase = Phase::Stepping;
                StepAction::Step
            }
            StepCommand::NextInstruction => {
                self.command = Some(command);
                let pc = target.pc()?;
                let insn = target.instruction(pc)?;
                if insn.call.is_some() {
                    let sp = target.sp()?;
                    self.run_to_return(pc + insn.len as u64, sp)
                } else {
                    self.phase = Phase::Stepping;
                    StepAction::Step
                }
            }
            StepCommand::Finish => {
                self.command = Some(command);
                let address = target.return_address()?;
                // returned frame has a strictly greater stack pointer
                let sp = target.sp()? + 1;
                self.run_to_return(address, sp)
            }
            StepCommand::Range(frame) => {
                self.command = Some(command);
                self.decide(frame, target)?
            }
        };
        Ok(action)
    }

    fn decide(
        &mut self,
        frame: StepFrame,
        target: &mut dyn StepTarget,
    ) -> Result<StepAction, Error> {
        let pc = target.pc()?;
        if !frame.contains(pc) {
            return Ok(self.done());
        }

        let insn = target.instruction(pc)?;
        let return_address = pc + insn.len as u64;
        let action = match (insn.call, frame.calls) {
            (None, _) => {
                self.phase = Phase::Stepping;
                StepAction::Step
            }
            (Some(CallTarget::Direct(callee)), calls) => {
                let callee = TargetAddress::new(pc.domain(), callee);
                if frame.contains(callee) {
                    self.phase = Phase::Stepping;
                    return Ok(StepAction::Step);
                }
                if calls == CallPolicy::Follow {
                    if let Some(trampoline) = target.trampoline(callee) {
                        let sp = target.sp()?;
                        debug!(target: "debugger", "call at {pc} goes through a trampoline");
                        self.phase = Phase::Compiling { return_address, sp };
                        return Ok(StepAction::Compile(trampoline));
                    }
                    if target.is_steppable(callee) {
                        self.phase = Phase::Stepping;
                        return Ok(StepAction::Step);
                    }
                }
                let sp = target.sp()?;
                self.run_to_return(return_address, sp)
            }
            (Some(CallTarget::Indirect), CallPolicy::Follow) => {
                let sp = target.sp()?;
                self.phase = Phase::Landing { return_address, sp };
                StepAction::Step
            }
            (Some(CallTarget::Indirect), CallPolicy::Skip) => {
                let sp = target.sp()?;
                self.run_to_return(return_address, sp)
            }
        };
        Ok(action)
    }

    fn proceed(&mut self, target: &mut dyn StepTarget) -> Result<StepAction, Error> {
        match self.command {
            Some(StepCommand::Range(frame)) => self.decide(frame, target),
            Some(_) => Ok(self.done()),
            None => Ok(StepAction::Done),
        }
    }

    /// Single step requested by the engine is complete.
    pub fn on_step_complete(&mut self, target: &mut dyn StepTarget) -> Result<StepAction, Error> {
        match self.phase {
            Phase::Landing { return_address, sp } => {
                let pc = target.pc()?;
                let in_frame = self.frame().is_some_and(|f| f.contains(pc));
                if in_frame {
                    self.proceed(target)
                } else if target.is_steppable(pc) {
                    Ok(self.done())
                } else {
                    debug!(target: "debugger", "landed at {pc} without debug info, run to {return_address}");
                    Ok(self.run_to_return(return_address, sp))
                }
            }
            Phase::Stepping => self.proceed(target),
            // stray single step, e.g. after a trap step over
            _ => Ok(self.resume_action()),
        }
    }

    /// Temporary trap of the engine hit.
    pub fn on_temp_trap(
        &mut self,
        target: &mut dyn StepTarget,
        address: TargetAddress,
    ) -> Result<StepAction, Error> {
        match self.phase {
            Phase::RunToReturn { address: ret, sp } if ret == address => {
                if target.sp()? >= sp {
                    self.proceed(target)
                } else {
                    // recursive call of the same function
                    Ok(StepAction::RunTo(ret))
                }
            }
            Phase::RunToCode { address: code } if code == address => Ok(self.done()),
            _ => Ok(self.resume_action()),
        }
    }

    /// Compile invocation returned an address of compiled code, zero if compilation failed.
    pub fn on_compiled(&mut self, code: u64) -> Result<StepAction, Error> {
        let Phase::Compiling { return_address, sp } = self.phase else {
            return Ok(self.resume_action());
        };
        if code == 0 {
            debug!(target: "debugger", "method not compiled, step over a call");
            return Ok(self.run_to_return(return_address, sp));
        }
        let address = TargetAddress::new(return_address.domain(), code);
        self.phase = Phase::RunToCode { address };
        Ok(StepAction::RunTo(address))
    }

    /// Action that keeps a current phase going.
    fn resume_action(&self) -> StepAction {
        match self.phase {
            Phase::Idle => StepAction::Done,
            Phase::Stepping | Phase::Landing { .. } => StepAction::Step,
            Phase::RunToReturn { address, .. } | Phase::RunToCode { address } => {
                StepAction::RunTo(address)
            }
            Phase::Compiling { .. } => StepAction::Resume,
        }
    }
}
