//! Configuration loading.
//!
//! The config file is a flat YAML mapping with dotted keys
//! (`Camera.fx: 500.0`, `ORBextractor.nFeatures: 1000`, ...). Keys that
//! are absent keep their compiled-in defaults; a missing or unparsable
//! file is a fatal error. The parsed `Config` is a plain value passed by
//! reference into the components that need it.

use std::path::Path;

use thiserror::Error;
use yaml_rust::{Yaml, YamlLoader};

use crate::camera::PinholeCamera;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] yaml_rust::ScanError),
    #[error("config file is not a YAML mapping")]
    NotAMapping,
}

/// Pinhole intrinsics, distortion and sensor constants.
#[derive(Debug, Clone, Copy)]
pub struct CameraConfig {
    pub width: u32,
    pub height: u32,
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub k1: f64,
    pub k2: f64,
    pub k3: f64,
    pub p1: f64,
    pub p2: f64,
    pub fps: f64,
    /// Stereo baseline times fx.
    pub bf: f64,
}

/// Feature extractor tuning, forwarded to the external extractor factory.
#[derive(Debug, Clone, Copy)]
pub struct OrbConfig {
    pub n_features: u32,
    pub scale_factor: f64,
    pub n_levels: u32,
    pub ini_th_fast: u32,
    pub min_th_fast: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub camera: CameraConfig,
    /// Close-point threshold, in units of baseline (see [`Config::th_depth_m`]).
    pub th_depth: f64,
    /// Depth-image value corresponding to one meter.
    pub depth_map_factor: f64,
    pub orb: OrbConfig,
    /// Enable the fiducial-pattern bootstrap.
    pub use_pattern: bool,
    /// Madgwick orientation filter gain.
    pub madgwick_gain: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera: CameraConfig {
                width: 640,
                height: 480,
                fx: 500.0,
                fy: 500.0,
                cx: 320.0,
                cy: 240.0,
                k1: 0.0,
                k2: 0.0,
                k3: 0.0,
                p1: 0.0,
                p2: 0.0,
                fps: 30.0,
                bf: 40.0,
            },
            th_depth: 40.0,
            depth_map_factor: 5000.0,
            orb: OrbConfig {
                n_features: 1000,
                scale_factor: 2.0,
                n_levels: 5,
                ini_th_fast: 20,
                min_th_fast: 7,
            },
            use_pattern: false,
            madgwick_gain: 0.1,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_str(&text)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(text: &str) -> Result<Self, ConfigError> {
        let docs = YamlLoader::load_from_str(text)?;
        let root = docs.first().ok_or(ConfigError::NotAMapping)?;
        if root.as_hash().is_none() {
            return Err(ConfigError::NotAMapping);
        }

        let mut config = Config::default();
        {
            let cam = &mut config.camera;
            read_u32(root, "Camera.w", &mut cam.width);
            read_u32(root, "Camera.h", &mut cam.height);
            read_f64(root, "Camera.fx", &mut cam.fx);
            read_f64(root, "Camera.fy", &mut cam.fy);
            read_f64(root, "Camera.cx", &mut cam.cx);
            read_f64(root, "Camera.cy", &mut cam.cy);
            read_f64(root, "Camera.k1", &mut cam.k1);
            read_f64(root, "Camera.k2", &mut cam.k2);
            read_f64(root, "Camera.k3", &mut cam.k3);
            read_f64(root, "Camera.p1", &mut cam.p1);
            read_f64(root, "Camera.p2", &mut cam.p2);
            read_f64(root, "Camera.fps", &mut cam.fps);
            read_f64(root, "Camera.bf", &mut cam.bf);
        }
        read_f64(root, "ThDepth", &mut config.th_depth);
        read_f64(root, "DepthMapFactor", &mut config.depth_map_factor);
        read_u32(root, "ORBextractor.nFeatures", &mut config.orb.n_features);
        read_f64(root, "ORBextractor.scaleFactor", &mut config.orb.scale_factor);
        read_u32(root, "ORBextractor.nLevels", &mut config.orb.n_levels);
        read_u32(root, "ORBextractor.iniThFAST", &mut config.orb.ini_th_fast);
        read_u32(root, "ORBextractor.minThFAST", &mut config.orb.min_th_fast);
        read_bool(root, "UsePattern", &mut config.use_pattern);
        read_f64(root, "MadgwickGain", &mut config.madgwick_gain);

        Ok(config)
    }

    /// Frame rate with the zero-value fallback applied.
    pub fn fps(&self) -> f64 {
        if self.camera.fps == 0.0 {
            30.0
        } else {
            self.camera.fps
        }
    }

    /// Close-point threshold in meters: `bf * ThDepth / fx`.
    pub fn th_depth_m(&self) -> f64 {
        self.camera.bf * self.th_depth / self.camera.fx
    }

    /// Multiplier taking raw depth-image values to meters.
    pub fn depth_scale(&self) -> f32 {
        if self.depth_map_factor.abs() < 1e-5 {
            1.0
        } else {
            (1.0 / self.depth_map_factor) as f32
        }
    }

    pub fn pinhole(&self) -> PinholeCamera {
        PinholeCamera {
            width: self.camera.width,
            height: self.camera.height,
            fx: self.camera.fx,
            fy: self.camera.fy,
            cx: self.camera.cx,
            cy: self.camera.cy,
            k1: self.camera.k1,
            k2: self.camera.k2,
            k3: self.camera.k3,
            p1: self.camera.p1,
            p2: self.camera.p2,
        }
    }
}

fn read_f64(root: &Yaml, key: &str, out: &mut f64) {
    let value = &root[key];
    if let Some(v) = value.as_f64() {
        *out = v;
    } else if let Some(v) = value.as_i64() {
        *out = v as f64;
    }
}

fn read_u32(root: &Yaml, key: &str, out: &mut u32) {
    if let Some(v) = root[key].as_i64() {
        if v >= 0 {
            *out = v as u32;
        }
    }
}

fn read_bool(root: &Yaml, key: &str, out: &mut bool) {
    match &root[key] {
        Yaml::Boolean(v) => *out = *v,
        Yaml::Integer(v) => *out = *v != 0,
        _ => {}
    }
}
