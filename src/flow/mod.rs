pub mod band;
pub mod message;
pub mod trigger;
pub mod writer;

pub use band::Band;
pub use message::FlowMessage;
pub use writer::{FlowWriter, WriterState};
