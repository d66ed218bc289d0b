//! Accept-socket construction. The only transport this
//! crate implements is TCP: UDP and the generic stream-server framework
//! the teacher carried are out of scope for a TCP-only transport.

pub mod tcp;
