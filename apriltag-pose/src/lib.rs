pub mod error;
pub mod euclidean;
pub mod camera;
pub mod detection;
pub mod field;
pub mod pnp;
pub mod tag;
pub mod localization;

pub use camera::CameraParameters;
pub use detection::{AprilTagDetection, TagDetector};
pub use error::{
    ConfigurationError, EstimationError, FieldError, FrameMismatchError, TransformError,
};
pub use euclidean::Transform;
pub use field::AprilTagField;
pub use localization::{
    CameraLocalizer, LocalizationResult, LocalizationStrategy, LowestAmbiguityStrategy,
    MultiTagPnpStrategy, MultiTagSpecialStrategy, StrategyKind,
};
pub use pnp::{solve_pnp, PnpMethod};
