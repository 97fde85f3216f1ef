/*!
Error types shared across the sampler modules.

Only *fatal* conditions are surfaced through [`SamplerError`]. Recoverable
conditions that Markov kernels handle locally (degenerate density values,
divergent Hamiltonian trajectories, adaptation underflow) never become
errors; they are folded into the accept/reject mechanics and reported via
[`StepInfo`](crate::core::StepInfo) and the `log` facade instead.
*/

use thiserror::Error;

/// Fatal conditions raised by sampler construction and the outer sampling
/// calls.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SamplerError {
    /// A proposal, momentum density, channel, or start state disagrees with
    /// the dimension the target density declares.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// Channel or importance weights containing a negative or non-finite
    /// entry, or a channel weight vector summing to zero.
    #[error("invalid weights: {0}")]
    InvalidWeights(String),

    /// A multi-channel mixture needs at least one channel.
    #[error("multi-channel mixture needs at least one channel")]
    EmptyChannelList,

    /// A covariance matrix handed to a Gaussian density or proposal kernel
    /// is not symmetric positive definite.
    #[error("covariance matrix is not positive definite")]
    NotPositiveDefinite,

    /// `sample` or `step` was called before `init_sampler`.
    #[error("sampler not initialized: call init_sampler before stepping")]
    NotInitialized,
}

/// Returns `DimensionMismatch` unless the two dimensions agree.
pub(crate) fn check_dim(expected: usize, got: usize) -> Result<(), SamplerError> {
    if expected == got {
        Ok(())
    } else {
        Err(SamplerError::DimensionMismatch { expected, got })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_dim() {
        assert!(check_dim(3, 3).is_ok());
        assert_eq!(
            check_dim(3, 2),
            Err(SamplerError::DimensionMismatch {
                expected: 3,
                got: 2
            })
        );
    }

    #[test]
    fn test_display_messages() {
        let err = SamplerError::DimensionMismatch {
            expected: 2,
            got: 5,
        };
        assert_eq!(err.to_string(), "dimension mismatch: expected 2, got 5");

        let err = SamplerError::InvalidWeights("weights sum to zero".to_string());
        assert!(err.to_string().contains("weights sum to zero"));
    }
}
