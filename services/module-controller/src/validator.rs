//! Module definition checks run before activation.

use std::fs;
use std::io;
use std::path::PathBuf;

use extmod_reconcile::{MAX_EXTERNAL_WEIGHT, MIN_EXTERNAL_WEIGHT};
use thiserror::Error;

use crate::model::ModuleDefinition;

/// Validation failures. The message ends up on the suspended release.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("external module weight must be between {min} and {max}, got {weight}")]
    WeightOutOfRange { weight: u32, min: u32, max: u32 },

    #[error("cannot validate module without path. Path is required to load openapi specs")]
    MissingPath,

    #[error("module directory {0} does not exist")]
    NotADirectory(PathBuf),

    #[error("read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid schema {path}: {source}")]
    Schema {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Checks a downloaded module before it is activated.
pub trait ModuleValidator: Send + Sync {
    fn validate(&self, definition: &ModuleDefinition) -> Result<(), ValidationError>;
}

/// Check the weight range and path, then run `validator`.
pub fn validate_module(
    definition: &ModuleDefinition,
    validator: &dyn ModuleValidator,
) -> Result<(), ValidationError> {
    if !(MIN_EXTERNAL_WEIGHT..=MAX_EXTERNAL_WEIGHT).contains(&definition.weight) {
        return Err(ValidationError::WeightOutOfRange {
            weight: definition.weight,
            min: MIN_EXTERNAL_WEIGHT,
            max: MAX_EXTERNAL_WEIGHT,
        });
    }

    if definition.path.as_os_str().is_empty() {
        return Err(ValidationError::MissingPath);
    }

    validator.validate(definition)
}

/// Requires the payload to be a directory whose `openapi/*.yaml` files parse.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayoutValidator;

impl ModuleValidator for LayoutValidator {
    fn validate(&self, definition: &ModuleDefinition) -> Result<(), ValidationError> {
        if !definition.path.is_dir() {
            return Err(ValidationError::NotADirectory(definition.path.clone()));
        }

        let openapi = definition.path.join("openapi");
        let entries = match fs::read_dir(&openapi) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(source) => return Err(ValidationError::Io { path: openapi, source }),
        };

        for entry in entries {
            let path = entry
                .map_err(|source| ValidationError::Io {
                    path: openapi.clone(),
                    source,
                })?
                .path();
            if !matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml" | "yml")
            ) {
                continue;
            }

            let content = fs::read_to_string(&path).map_err(|source| ValidationError::Io {
                path: path.clone(),
                source,
            })?;
            serde_yaml::from_str::<serde_yaml::Value>(&content)
                .map_err(|source| ValidationError::Schema { path, source })?;
        }

        Ok(())
    }
}
