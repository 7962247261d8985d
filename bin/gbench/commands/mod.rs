//! gbench subcommands

pub mod demos;
pub mod run;
pub mod summarize;
