//! Status taxonomy returned by the multi-layer encoder.
//!
//! `Ok(())` plays the role of the host's "OK" status; every other outcome is
//! a [`CodecError`]. Collaborators (codec engines, image utilities) report
//! their own failures as `anyhow::Error`, which the encoder logs and folds
//! into one of these variants.

use thiserror::Error;

pub const STATUS_OK: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Bad codec parameters handed to `init_encode`.
    #[error("invalid codec parameter")]
    InvalidParameter,

    /// The external simulcast validator rejected the stream cascade.
    #[error("simulcast parameters not supported")]
    SimulcastParametersUnsupported,

    /// A codec engine session could not be created, opened or configured.
    #[error("encoder unavailable")]
    EncoderUnavailable,

    /// Encode was called before a successful init, or without a callback.
    #[error("encoder uninitialized")]
    Uninitialized,

    /// Runtime conversion or engine encode failure.
    #[error("encoder failure")]
    EncoderFailure,
}

impl CodecError {
    /// Numeric status code understood by hosts that speak the classic
    /// video-codec return values.
    pub fn code(&self) -> i32 {
        match self {
            CodecError::InvalidParameter => -4,
            CodecError::SimulcastParametersUnsupported => -15,
            CodecError::EncoderUnavailable => -1,
            CodecError::Uninitialized => -7,
            CodecError::EncoderFailure => -16,
        }
    }
}

pub type CodecResult<T = ()> = Result<T, CodecError>;

/// Collapses a result into the host status code.
pub fn status_code(result: &CodecResult) -> i32 {
    match result {
        Ok(()) => STATUS_OK,
        Err(e) => e.code(),
    }
}
