pub mod addr;
pub mod connection;
pub mod listener;

pub use addr::{Addr, ListenAddr, Transport};
pub use connection::{Conn, ConnWaker, DetachedStream, Socket};
pub use listener::Listener;
