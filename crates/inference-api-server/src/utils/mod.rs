pub mod error;
pub mod token_estimator;
