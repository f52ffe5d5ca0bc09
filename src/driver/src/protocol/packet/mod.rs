pub mod buf;
pub mod packet_io;
pub mod readers;
pub mod writers;

pub use buf::PacketBuf;
pub use packet_io::{PacketIo, Stream};
