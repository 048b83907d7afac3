use thiserror::Error;

/// Errors surfaced by the LAN transport at construction time. Runtime
/// failures stay local to the affected connection and are logged, never
/// propagated to the embedding application.
#[derive(Error, Debug)]
pub enum LanError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(#[from] parley_store::StoreError),
}
