#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to compress payload: {0}")]
    Compress(std::io::Error),

    #[error("failed to decompress payload: {0}")]
    Decompress(std::io::Error),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
