#![deny(unsafe_code)]

mod builder;
mod error;
mod stream;

pub use builder::{Acceptor, Builder, Listener};
pub use error::MqttError;
pub use stream::MqttStream;

pub type Error = anyhow::Error;
pub type Result<T> = anyhow::Result<T, Error>;
