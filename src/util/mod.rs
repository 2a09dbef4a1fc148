//! Small helpers used by the maintenance loop.

mod clamped;
mod quantile;
mod rate_limit;

pub use clamped::ClampedCounter;
pub use quantile::FrugalQuantileEstimator;
pub use rate_limit::RateLimiter;
