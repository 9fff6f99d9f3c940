use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecisionError {
    #[error("no price for {symbol}: {reason}")]
    PriceUnavailable { symbol: String, reason: String },

    #[error("invalid price {price} for {symbol}")]
    InvalidPrice { symbol: String, price: f64 },

    #[error("decision not found: {0}")]
    NotFound(String),

    #[error("decision {id} cannot be executed: {reason}")]
    NotExecutable { id: String, reason: String },

    #[error("order execution failed: {0}")]
    Execution(String),
}

pub type Result<T> = std::result::Result<T, DecisionError>;
