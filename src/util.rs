use crate::error::Error;
use kube::runtime::finalizer::Error as FinalizerError;

pub fn map_finalizer_error(e: FinalizerError<Error>) -> Error {
    match e {
        FinalizerError::AddFinalizer(error) => error.into(),
        FinalizerError::RemoveFinalizer(error) => error.into(),
        FinalizerError::ApplyFailed(error) => error,
        FinalizerError::CleanupFailed(error) => error,
        FinalizerError::UnnamedObject => {
            Error::InvalidKubernetesObject("Object has no name".to_string())
        }
        FinalizerError::InvalidFinalizer => {
            Error::InvalidKubernetesObject("Object has invalid finalizer".to_string())
        }
    }
}
