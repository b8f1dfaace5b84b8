use thiserror::Error;

use crate::pnp::PnpMethod;

/// A PnP solve failed or its inputs were degenerate.
///
/// Strategies treat this as recoverable: they fall back or report no pose.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EstimationError {
    #[error("got {object} object points but {image} image points")]
    MismatchedLengths { object: usize, image: usize },

    #[error("{method} needs at least {required} point correspondences, got {actual}")]
    InsufficientPoints {
        method: PnpMethod,
        required: usize,
        actual: usize,
    },

    #[error("{method} needs exactly {required} point correspondences, got {actual}")]
    WrongPointCount {
        method: PnpMethod,
        required: usize,
        actual: usize,
    },

    #[error("input contains non-finite coordinates")]
    NonFinite,

    #[error("object points are collinear")]
    Collinear,

    #[error("object points are not coplanar")]
    NotCoplanar,

    #[error("degenerate configuration: {0}")]
    Degenerate(&'static str),

    #[error("solver produced no valid solution")]
    NoSolution,
}

/// Invalid construction of a strategy, camera, or field.
///
/// Raised eagerly by constructors, never at estimation time.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("{strategy} cannot use the planar-only {method} method")]
    PlanarMethod {
        strategy: &'static str,
        method: PnpMethod,
    },

    #[error("{0} cannot fall back to a strategy of the same kind")]
    ReflexiveFallback(&'static str),

    #[error("invalid camera parameters: {0}")]
    InvalidCamera(String),

    #[error("tag size must be positive and finite, got {0}")]
    InvalidTagSize(f64),
}

/// Composition of two transforms whose frame tags disagree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot compose: input frame `{expected}` does not match output frame `{found}`")]
pub struct FrameMismatchError {
    pub expected: String,
    pub found: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransformError {
    #[error("matrix is not a rigid transform: {0}")]
    NotRigid(&'static str),
}

/// Field lookups and field description loading.
#[derive(Debug, Error)]
pub enum FieldError {
    #[error("tag {0} is not on the field")]
    UnknownTag(u32),

    #[error("duplicate fiducial id {0}")]
    DuplicateTag(u32),

    #[error("unsupported field description extension: {0}")]
    UnsupportedFormat(String),

    #[error("failed to read field description: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "serde")]
    #[error("invalid JSON field description: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "serde")]
    #[error("invalid TOML field description: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("fiducial {id}: {source}")]
    Transform {
        id: u32,
        #[source]
        source: TransformError,
    },

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}
