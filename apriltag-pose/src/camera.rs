use nalgebra::{Matrix3, Point2, Point3};

use crate::error::ConfigurationError;

/// Fixed-point iterations used to invert the distortion model.
const UNDISTORT_MAX_ITERATIONS: usize = 50;
const UNDISTORT_TOLERANCE: f64 = 1e-15;

/// Pinhole intrinsics plus Brown-Conrady distortion (k1, k2, p1, p2, k3).
///
/// This is the model produced by the usual checkerboard calibration
/// routines. Fields are read-only; construct through [`CameraParameters::new`]
/// or [`CameraParameters::from_matrices`] so that the focal lengths are
/// validated.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(try_from = "RawCameraParameters")
)]
pub struct CameraParameters {
    fx: f64,
    fy: f64,
    cx: f64,
    cy: f64,
    k1: f64,
    k2: f64,
    p1: f64,
    p2: f64,
    k3: f64,
}

impl CameraParameters {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fx: f64,
        fy: f64,
        cx: f64,
        cy: f64,
        k1: f64,
        k2: f64,
        p1: f64,
        p2: f64,
        k3: f64,
    ) -> Result<Self, ConfigurationError> {
        let params = Self {
            fx,
            fy,
            cx,
            cy,
            k1,
            k2,
            p1,
            p2,
            k3,
        };
        params.validate()?;
        Ok(params)
    }

    /// Distortion-free pinhole camera.
    pub fn pinhole(fx: f64, fy: f64, cx: f64, cy: f64) -> Result<Self, ConfigurationError> {
        Self::new(fx, fy, cx, cy, 0.0, 0.0, 0.0, 0.0, 0.0)
    }

    /// Build from a calibration result.
    ///
    /// The camera matrix is `[[fx, 0, cx], [0, fy, cy], [0, 0, 1]]` and the
    /// distortion vector is `[k1, k2, p1, p2, k3]`.
    pub fn from_matrices(
        camera_matrix: &Matrix3<f64>,
        distortion: &[f64; 5],
    ) -> Result<Self, ConfigurationError> {
        Self::new(
            camera_matrix[(0, 0)],
            camera_matrix[(1, 1)],
            camera_matrix[(0, 2)],
            camera_matrix[(1, 2)],
            distortion[0],
            distortion[1],
            distortion[2],
            distortion[3],
            distortion[4],
        )
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        let values = [
            self.fx, self.fy, self.cx, self.cy, self.k1, self.k2, self.p1, self.p2, self.k3,
        ];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(ConfigurationError::InvalidCamera(
                "parameters must be finite".to_string(),
            ));
        }
        if self.fx <= 0.0 || self.fy <= 0.0 {
            return Err(ConfigurationError::InvalidCamera(format!(
                "focal lengths must be positive, got fx={} fy={}",
                self.fx, self.fy
            )));
        }
        Ok(())
    }

    /// Look up a built-in preset by name (see [`PRESETS`]).
    pub fn preset(name: &str) -> Option<Self> {
        PRESETS
            .iter()
            .find(|(preset, _)| preset.eq_ignore_ascii_case(name))
            .map(|(_, params)| *params)
    }

    pub fn fx(&self) -> f64 {
        self.fx
    }

    pub fn fy(&self) -> f64 {
        self.fy
    }

    pub fn cx(&self) -> f64 {
        self.cx
    }

    pub fn cy(&self) -> f64 {
        self.cy
    }

    /// The 3x3 intrinsic matrix.
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    /// Distortion coefficients as `[k1, k2, p1, p2, k3]`.
    pub fn distortion_vector(&self) -> [f64; 5] {
        [self.k1, self.k2, self.p1, self.p2, self.k3]
    }

    pub fn has_distortion(&self) -> bool {
        self.distortion_vector().iter().any(|&k| k != 0.0)
    }

    /// Apply lens distortion to a normalized image point.
    pub fn distort_normalized(&self, p: &Point2<f64>) -> Point2<f64> {
        let (x, y) = (p.x, p.y);
        let r2 = x * x + y * y;
        let radial = 1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3));
        let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        Point2::new(x * radial + dx, y * radial + dy)
    }

    /// Project a point expressed in the camera frame to pixel coordinates.
    ///
    /// The point must lie in front of the camera (`z > 0`).
    pub fn project(&self, point: &Point3<f64>) -> Point2<f64> {
        let normalized = Point2::new(point.x / point.z, point.y / point.z);
        let d = self.distort_normalized(&normalized);
        Point2::new(self.fx * d.x + self.cx, self.fy * d.y + self.cy)
    }

    /// Map a pixel to its undistorted normalized image coordinates.
    pub fn undistort(&self, pixel: &Point2<f64>) -> Point2<f64> {
        let x0 = (pixel.x - self.cx) / self.fx;
        let y0 = (pixel.y - self.cy) / self.fy;
        if !self.has_distortion() {
            return Point2::new(x0, y0);
        }

        let (mut x, mut y) = (x0, y0);
        for _ in 0..UNDISTORT_MAX_ITERATIONS {
            let r2 = x * x + y * y;
            let radial = 1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3));
            let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
            let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
            let nx = (x0 - dx) / radial;
            let ny = (y0 - dy) / radial;
            let step = (nx - x).abs() + (ny - y).abs();
            x = nx;
            y = ny;
            if step < UNDISTORT_TOLERANCE {
                break;
            }
        }
        Point2::new(x, y)
    }

    pub fn undistort_points(&self, pixels: &[Point2<f64>]) -> Vec<Point2<f64>> {
        pixels.iter().map(|p| self.undistort(p)).collect()
    }
}

#[cfg(feature = "serde")]
#[derive(serde::Deserialize)]
struct RawCameraParameters {
    fx: f64,
    fy: f64,
    cx: f64,
    cy: f64,
    #[serde(default)]
    k1: f64,
    #[serde(default)]
    k2: f64,
    #[serde(default)]
    p1: f64,
    #[serde(default)]
    p2: f64,
    #[serde(default)]
    k3: f64,
}

#[cfg(feature = "serde")]
impl TryFrom<RawCameraParameters> for CameraParameters {
    type Error = ConfigurationError;

    fn try_from(raw: RawCameraParameters) -> Result<Self, Self::Error> {
        Self::new(
            raw.fx, raw.fy, raw.cx, raw.cy, raw.k1, raw.k2, raw.p1, raw.p2, raw.k3,
        )
    }
}

// ── Presets ──
//
// Calibrations of cameras used during development. Calibrate your own
// camera for real use.

/// Depstech 1080p webcam.
pub const DEPSTECH: CameraParameters = CameraParameters {
    fx: 1329.143348,
    fy: 1326.537785,
    cx: 945.392392,
    cy: 521.144703,
    k1: -0.348650,
    k2: 0.098710,
    p1: -0.000157,
    p2: -0.001851,
    k3: 0.0,
};

/// Logitech C920 webcam.
pub const LOGITECH_C920: CameraParameters = CameraParameters {
    fx: 1303.4858439074037,
    fy: 1313.7268166341282,
    cx: 953.0550046450967,
    cy: 487.428417101308,
    k1: -0.04617273252027395,
    k2: 0.2753447226702122,
    p1: -0.010067837101803492,
    p2: -0.005296327017158184,
    k3: -0.38168395944619604,
};

/// iPhone 13 mini main back camera.
pub const IPHONE_13_MINI_MAIN: CameraParameters = CameraParameters {
    fx: 975.0944324169702,
    fy: 975.7210449202735,
    cx: 651.2516360655774,
    cy: 354.20133381181955,
    k1: 0.16202747407118365,
    k2: -0.8339518338379913,
    p1: -0.0021712184519895234,
    p2: 0.003869488985826069,
    k3: 1.326544376051906,
};

/// ArduCam OV9281 global-shutter module.
pub const ARDUCAM_OV9281: CameraParameters = CameraParameters {
    fx: 921.4459062879504,
    fy: 920.5545512136466,
    cx: 640.4116071984264,
    cy: 389.86971089068913,
    k1: 0.07166453170075777,
    k2: -0.11227733992947839,
    p1: -0.0014616393622597851,
    p2: -0.0014945237103234227,
    k3: 0.04562948613626775,
};

/// FaceTime HD laptop camera.
pub const FACETIME_HD: CameraParameters = CameraParameters {
    fx: 954.0874994019651,
    fy: 949.9159862376827,
    cx: 660.572082940535,
    cy: 329.78814306885795,
    k1: 0.036998502838994515,
    k2: -0.13207581435883872,
    p1: -0.000045055253893522236,
    p2: -0.007745497656725853,
    k3: 0.11519181871308336,
};

/// Samsung Galaxy S24+ main camera.
pub const GALAXY_S24_PLUS_MAIN: CameraParameters = CameraParameters {
    fx: 1577.6710882155696,
    fy: 1578.1918913274176,
    cx: 536.7027520891314,
    cy: 980.2679188012452,
    k1: -0.0645156141142605,
    k2: 0.14588713723707655,
    p1: 0.003958174370212018,
    p2: 0.00012977471972707647,
    k3: -0.1784624986145353,
};

/// Named presets, as accepted by [`CameraParameters::preset`].
pub const PRESETS: &[(&str, CameraParameters)] = &[
    ("depstech", DEPSTECH),
    ("logitech-c920", LOGITECH_C920),
    ("iphone-13-mini", IPHONE_13_MINI_MAIN),
    ("arducam-ov9281", ARDUCAM_OV9281),
    ("facetime-hd", FACETIME_HD),
    ("galaxy-s24-plus", GALAXY_S24_PLUS_MAIN),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_focal_length() {
        assert!(CameraParameters::pinhole(0.0, 500.0, 320.0, 240.0).is_err());
        assert!(CameraParameters::pinhole(500.0, -1.0, 320.0, 240.0).is_err());
        assert!(CameraParameters::pinhole(f64::NAN, 500.0, 320.0, 240.0).is_err());
        assert!(CameraParameters::pinhole(500.0, 500.0, 320.0, 240.0).is_ok());
    }

    #[test]
    fn matrices_round_trip() {
        let k = DEPSTECH.matrix();
        let d = DEPSTECH.distortion_vector();
        let back = CameraParameters::from_matrices(&k, &d).unwrap();
        assert_eq!(back, DEPSTECH);
        assert_eq!(k[(2, 2)], 1.0);
        assert_eq!(k[(0, 1)], 0.0);
    }

    #[test]
    fn presets_are_valid() {
        for (name, params) in PRESETS {
            assert!(params.validate().is_ok(), "preset {name} invalid");
        }
        assert_eq!(CameraParameters::preset("Depstech"), Some(DEPSTECH));
        assert!(CameraParameters::preset("pinhole-9000").is_none());
    }

    #[test]
    fn undistort_inverts_projection() {
        for params in [DEPSTECH, LOGITECH_C920, ARDUCAM_OV9281] {
            for &(x, y) in &[(0.0, 0.0), (0.3, -0.2), (-0.5, 0.35), (0.6, 0.3)] {
                let pixel = params.project(&Point3::new(x, y, 1.0));
                let back = params.undistort(&pixel);
                assert!(
                    (back.x - x).abs() < 1e-9 && (back.y - y).abs() < 1e-9,
                    "({x}, {y}) -> {pixel:?} -> {back:?}"
                );
            }
        }
    }

    #[test]
    fn pinhole_projection() {
        let cam = CameraParameters::pinhole(500.0, 400.0, 320.0, 240.0).unwrap();
        let p = cam.project(&Point3::new(1.0, -0.5, 2.0));
        assert!((p.x - 570.0).abs() < 1e-12);
        assert!((p.y - 140.0).abs() < 1e-12);
        assert!(!cam.has_distortion());
    }

    #[test]
    #[cfg(feature = "serde")]
    fn parse_toml_with_default_distortion() {
        let toml_str = r#"
            fx = 600.0
            fy = 600.0
            cx = 320.0
            cy = 240.0
            k1 = -0.1
        "#;
        let params: CameraParameters = toml::from_str(toml_str).unwrap();
        assert_eq!(params.distortion_vector(), [-0.1, 0.0, 0.0, 0.0, 0.0]);

        let bad = "fx = -600.0\nfy = 600.0\ncx = 0.0\ncy = 0.0\n";
        assert!(toml::from_str::<CameraParameters>(bad).is_err());
    }
}
