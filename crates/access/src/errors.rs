#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("invalid access rule document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{list} entry {index} is missing the 'database' field")]
    MissingDatabase { list: &'static str, index: usize },

    #[error("unknown column level security action '{0}', expected one of hash, mask, nullify, hide")]
    UnknownClsAction(String),

    #[error("{list} entry {index} has an empty row level security predicate")]
    EmptyPredicate { list: &'static str, index: usize },
}

pub type Result<T, E = AccessError> = std::result::Result<T, E>;
