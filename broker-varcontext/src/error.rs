use thiserror::Error;

pub type Result<T> = std::result::Result<T, VarContextError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VarContextError {
    #[error("couldn't cast {value} to {target}, {reason}")]
    TypeCast {
        value: String,
        target: String,
        reason: String,
    },

    #[error("couldn't parse JSON object: {0}")]
    Parse(String),

    #[error("couldn't compute the value for {name:?}, template: {template:?}, {reason}")]
    Evaluation {
        name: String,
        template: String,
        reason: String,
    },
}
