//! Framed JSON transport and the out-of-band status channel.

pub mod framed;
pub mod status;

pub use framed::{MessageReader, MessageWriter};
pub use status::{PythonException, StatusEvent};
