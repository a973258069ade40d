use thiserror::Error;

pub type CdiResult<T> = Result<T, CdiError>;

/// Status codes reported by the codec and the receive path. `RxPayloadError` is the only non-fatal
///  one: decoding or reassembly finished, but with data that failed an integrity check.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CdiError {
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("payload is structurally invalid")]
    InvalidPayload,
    #[error("buffer too small for payload")]
    BufferOverflow,
    #[error("payload received with errors")]
    RxPayloadError,
    #[error("pool exhausted")]
    PoolExhausted,
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl CdiError {
    /// Fatal errors mean the payload could not be interpreted at all, as opposed to data integrity
    ///  errors where a best-effort result was delivered.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CdiError::RxPayloadError | CdiError::PoolExhausted)
    }
}

impl From<anyhow::Error> for CdiError {
    fn from(value: anyhow::Error) -> Self {
        CdiError::Configuration(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::invalid_parameter(CdiError::InvalidParameter, true)]
    #[case::invalid_payload(CdiError::InvalidPayload, true)]
    #[case::overflow(CdiError::BufferOverflow, true)]
    #[case::rx_payload(CdiError::RxPayloadError, false)]
    #[case::pool(CdiError::PoolExhausted, false)]
    #[case::config(CdiError::Configuration("x".to_string()), true)]
    fn test_is_fatal(#[case] error: CdiError, #[case] expected: bool) {
        assert_eq!(error.is_fatal(), expected);
    }

    #[test]
    fn test_from_anyhow() {
        let error: CdiError = anyhow::anyhow!("capacity must be a power of two").into();
        assert_eq!(error, CdiError::Configuration("capacity must be a power of two".to_string()));
        assert_eq!(error.to_string(), "configuration error: capacity must be a power of two");
    }
}
