use std::sync::Arc;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The source could not be read as an image. Only this thumbnail fails.
    #[error("invalid source image: {0}")]
    InvalidSource(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error(transparent)]
    Catalog(#[from] photo_catalog::Error),

    #[error("thumbnail task failed: {0}")]
    Task(String),
}

impl Error {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source: Arc::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
