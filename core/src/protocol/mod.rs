//! Wire protocol: the `RemotingCommand` codec and the length-field frame
//! assembler that reconstructs commands from a raw TCP byte stream.

pub mod command;
pub mod framing;

pub use command::{response_code, CommandType, RemotingCommand, ONEWAY_FLAG, RESPONSE_FLAG};
pub use framing::FrameAssembler;
