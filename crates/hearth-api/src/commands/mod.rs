//! Slash commands: parsing and dispatch, outbound callbacks to custom
//! command endpoints, response posts, command CRUD and the built-ins.

pub mod builtin;
pub mod engine;
pub mod manage;
pub mod outbound;
pub mod registry;
pub mod response;

pub use engine::execute_command;
pub use registry::{CommandProvider, CommandRegistry};
pub use response::handle_command_response;

/// Which kind of provider answered a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostSource {
    Plugin,
    Custom,
    BuiltIn,
}

impl PostSource {
    /// Plugin and custom command output is posted on behalf of a bot.
    pub fn is_bot(self) -> bool {
        !matches!(self, PostSource::BuiltIn)
    }
}
