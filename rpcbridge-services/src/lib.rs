pub mod auth;
pub mod codec;
pub mod dispatch;
pub mod nonblocking;
pub mod pipeline;
pub mod transport;

#[cfg(test)]
mod testing;
