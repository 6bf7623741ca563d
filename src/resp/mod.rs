pub mod command;
pub mod parser;
pub mod types;
pub mod writer;

pub use command::Command;
pub use parser::{decode, into_result, parse, parse_slice};
pub use types::Reply;
pub use writer::{encode_bulk, encode_command, encode_pipeline};
