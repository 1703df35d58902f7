//! Device-side building blocks: the state mirror, the bus listener and the
//! reconnecting team runtime used by the `team-client` binary.

pub mod listener;
pub mod mirror;
pub mod runtime;
