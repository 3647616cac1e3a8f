use thiserror::Error;

/// Failures a rebalance (or a single chunk of one) can run into.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RebalanceError {
    #[error("no route found: {0}")]
    NoRouteFound(String),

    #[error("route too expensive: cheapest route found was {fee_ppm} ppm, but maxppm is {max_ppm}")]
    FeeExceeded { fee_ppm: u64, max_ppm: u64 },

    #[error("channel {0} is inactive")]
    ChannelInactive(String),

    #[error("payment failed: {0}")]
    PaymentFailed(String),

    #[error("refresh failed: {0}")]
    RefreshFailed(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RebalanceError {
    /// Stable name stored alongside attempt records.
    pub fn kind(&self) -> &'static str {
        match self {
            RebalanceError::NoRouteFound(_) => "no_route_found",
            RebalanceError::FeeExceeded { .. } => "fee_exceeded",
            RebalanceError::ChannelInactive(_) => "channel_inactive",
            RebalanceError::PaymentFailed(_) => "payment_failed",
            RebalanceError::RefreshFailed(_) => "refresh_failed",
            RebalanceError::InvalidRequest(_) => "invalid_request",
        }
    }

    pub fn refresh(err: anyhow::Error) -> Self {
        RebalanceError::RefreshFailed(format!("{:#}", err))
    }
}

pub type RebalanceResult<T> = Result<T, RebalanceError>;
