//! Process-level helpers shared by the library and the binary.

pub mod bootstrap;
pub mod retry;
pub mod shutdown;
