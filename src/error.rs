use thiserror::Error;

/// Builds a [`CpError::MalformedIr`] carrying the source location that detected it.
macro_rules! malformed_ir {
    ($msg:expr) => {
        crate::error::CpError::MalformedIr {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    ($fmt:expr, $($arg:tt)*) => {
        crate::error::CpError::MalformedIr {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

pub(crate) use malformed_ir;

/// Failure modes of the constant-propagation core.
///
/// Bottom values are not errors: unreachable code is an ordinary analysis
/// outcome and never surfaces here. Unresolvable references are recovered
/// locally by widening to Top, so they do not appear either.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub(crate) enum CpError {
    /// An encoded constant does not fit the signed 64-bit lattice carrier.
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    /// The IR violates a shape rule the analysis relies on.
    #[error("malformed IR - {file}:{line}: {message}")]
    MalformedIr {
        message: String,
        file: &'static str,
        line: u32,
    },

    /// A configuration value required by the requested mode is absent or unusable.
    #[error("missing configuration: {0}")]
    ConfigMissing(String),

    /// The driver stopped the analysis before any round completed.
    #[error("analysis cancelled before the first round completed")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_ir_records_location() {
        let error = malformed_ir!("move-result at {} has no producer", 3);
        match error {
            CpError::MalformedIr { message, file, .. } => {
                assert_eq!(message, "move-result at 3 has no producer");
                assert!(file.ends_with("error.rs"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn errors_survive_anyhow_round_trip() {
        let error: anyhow::Error = CpError::ConfigMissing("param handler".to_string()).into();
        let downcast = error.downcast_ref::<CpError>().expect("downcast");
        assert_eq!(
            downcast,
            &CpError::ConfigMissing("param handler".to_string())
        );
    }
}
