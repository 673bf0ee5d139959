//! The local application API: a length-prefixed TCP protocol through which
//! clients announce messages to spread, subscribe to received messages by
//! data type, and validate them.

pub mod packet;
pub mod server;
