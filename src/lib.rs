//! Inferior control and stepping core of a debugger for processes running a managed runtime.
//!
//! [`debugger::Debugger`] drives traced processes through a [`debugger::channel::ControlChannel`]
//! (ptrace on linux), keeps breakpoints and steps consistent across threads, and cooperates with
//! a runtime through its notification protocol.

pub mod debugger;
