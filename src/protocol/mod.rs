//! Wire format shared by the runner and its clients.
//!
//! A request is arbitrary bytes followed by a single NUL; so is the reply.
//! There is no length prefix, so neither side may put a NUL inside a body.

pub mod command;
pub mod frame;
pub mod shape;

pub use command::{BangDirective, Body, Request, SlashCommand, CURRENT_SETTINGS};
pub use frame::{read_frame, write_frame};
pub use shape::{RequestShape, ShapedRequest};

pub const NULL: u8 = 0;
pub const DEFAULT_PORT: u16 = 6502;

/// Closes a turn.
pub const FULL_STOP: &str = "\n\n~~~(end)~~~\n\n";
/// Opens the closing fence; a prompt ending here asks only for the close.
pub const HALF_STOP: &str = "\n\n~~~(";
/// What follows `HALF_STOP` to form `FULL_STOP`.
pub const CLOSE_SUFFIX: &str = "end)~~~\n\n";

/// `"<role>: "` with exactly one trailing space and no newline.
pub fn role_header(role: &str) -> String {
    format!("{}: ", role)
}
