pub mod codec;
pub mod server;
pub mod session;
