/// Outcome of a single API call made on behalf of the engine.
///
/// Not-found and conflict are expected during reconciliation and are matched on by callers.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found")]
    NotFound,
    #[error("object already exists")]
    Conflict,
    #[error(transparent)]
    Other(kube::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<kube::Error> for StoreError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound,
            kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict,
            other => StoreError::Other(other),
        }
    }
}
