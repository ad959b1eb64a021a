//! API error classification shared by the client seams
//!
//! The reconcile logic branches on a handful of API outcomes. Classifying
//! them once here lets the in-memory fakes return the same outcomes without
//! building transport errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict writing {0}: the object has been modified")]
    Conflict(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[source] kube::Error),
}

impl ClientError {
    /// Classify an API error for the object `name`
    pub fn from_kube(name: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => ClientError::NotFound(name.to_string()),
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                ClientError::AlreadyExists(name.to_string())
            }
            kube::Error::Api(ae) if ae.code == 409 => ClientError::Conflict(name.to_string()),
            other => ClientError::Kube(other),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }
}

/// Turn a 404 into `None`
pub fn not_found_as_none<T>(result: Result<T, ClientError>) -> Result<Option<T>, ClientError> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_as_none() {
        let missing: Result<i32, ClientError> = Err(ClientError::NotFound("foo".to_string()));
        assert!(matches!(not_found_as_none(missing), Ok(None)));

        let present: Result<i32, ClientError> = Ok(7);
        assert!(matches!(not_found_as_none(present), Ok(Some(7))));

        let conflict: Result<i32, ClientError> = Err(ClientError::Conflict("foo".to_string()));
        assert!(matches!(
            not_found_as_none(conflict),
            Err(ClientError::Conflict(_))
        ));
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            ClientError::AlreadyExists("foo-bar".to_string()).to_string(),
            "foo-bar already exists"
        );
        assert_eq!(
            ClientError::Conflict("foo".to_string()).to_string(),
            "conflict writing foo: the object has been modified"
        );
    }
}
