//! Control plane: command grammar, execution, TCP endpoint and operator prompt

pub mod client;
pub mod codec;
pub mod command;
pub mod dispatch;
pub mod prompt;
pub mod server;

pub use client::ControlClient;
pub use codec::{ControlCodec, ControlLine};
pub use command::{Command, HELP_TEXT};
pub use dispatch::{ControlPlane, Reply};
pub use prompt::{run_prompt, spawn_stdin_reader, PromptExit};
pub use server::ControlServer;
