// Domain Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Artifact name does not end with {suffix}: {path}")]
    InvalidArtifactName { path: String, suffix: String },

    #[error("Artifact path has no file name: {0}")]
    MissingFileName(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;
