use std::borrow::Cow;

use proto::ObjectError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored object is corrupt: {0}")]
    Object(#[from] ObjectError),
    #[error("datastore stopped")]
    Stopped,
    #[error("corrupted data: {0}")]
    Corrupted(Cow<'static, str>),
}
