pub mod poll;
pub mod server;
pub mod watch;
