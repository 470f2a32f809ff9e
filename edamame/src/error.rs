use thiserror::Error;

#[derive(Error, Debug)]
pub enum EdamameError {
    #[error("unrecognized {kind} `{name}`; expected one of: {expected}")]
    UnrecognizedVariant {
        kind: &'static str,
        name: String,
        expected: String,
    },

    #[error("dimension mismatch: the model expects {expected} features, but the data has {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("invalid counts: {0}")]
    InvalidCounts(String),

    #[error("numeric instability in epoch {epoch}, minibatch {batch}: {what}")]
    NumericInstability {
        epoch: usize,
        batch: usize,
        what: String,
    },

    #[error("unknown condition `{0}`")]
    UnknownCondition(String),
}

impl EdamameError {
    pub fn unrecognized(kind: &'static str, name: &str, expected: &[&str]) -> Self {
        EdamameError::UnrecognizedVariant {
            kind,
            name: name.to_string(),
            expected: expected.join(", "),
        }
    }
}
