// Network layer module
// Time packet codec and the UDP time provider

pub mod packet;
pub mod provider;

pub use packet::TimePacket;
pub use provider::TimeProvider;
