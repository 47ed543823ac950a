/* Umbrella error for everything between a device and a publisher. */

use thiserror::Error;

use crate::fields::DecodeError;
use crate::modbus::FrameError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("timed out")]
    Timeout,

    #[error("canceled")]
    Canceled,

    #[error("NAK received")]
    Nak,

    #[error("{0}")]
    Config(String),
}
