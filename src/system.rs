//! System assembly and thread orchestration.
//!
//! `SlamSystem` owns the shared map, spawns the local mapping thread, and
//! exposes the tracker's per-frame operations. The loop closing thread and
//! the viewer attach to the same shared structures from outside.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Result;
use nalgebra::Matrix4;
use parking_lot::Mutex;

use crate::config::Config;
use crate::features::{DepthImage, Image, ImuSample};
use crate::local_mapping::LocalMapper;
use crate::map::map::Map;
use crate::tracking::{Sensor, Tracker, TrackerExternals};

pub struct SlamSystem {
    map: Arc<Mutex<Map>>,
    local_mapper: Arc<LocalMapper>,
    tracker: Tracker,
    mapping_handle: Option<JoinHandle<()>>,
}

impl SlamSystem {
    /// Assemble the system and start the local mapping thread.
    pub fn new(config: &Config, sensor: Sensor, externals: TrackerExternals) -> Self {
        let map = Arc::new(Mutex::new(Map::new()));
        let local_mapper = Arc::new(LocalMapper::new());
        let tracker = Tracker::new(
            config,
            sensor,
            Arc::clone(&map),
            Arc::clone(&local_mapper),
            externals,
        );

        let mapping_handle = {
            let mapper = Arc::clone(&local_mapper);
            let map = Arc::clone(&map);
            thread::Builder::new()
                .name("local-mapping".into())
                .spawn(move || mapper.run(map))
                .expect("failed to spawn local mapping thread")
        };

        Self {
            map,
            local_mapper,
            tracker,
            mapping_handle: Some(mapping_handle),
        }
    }

    /// Assemble from a config file. A missing or invalid file refuses to
    /// start.
    pub fn from_config_file<P: AsRef<Path>>(
        path: P,
        sensor: Sensor,
        externals: TrackerExternals,
    ) -> Result<Self> {
        let config = Config::from_file(path)?;
        Ok(Self::new(&config, sensor, externals))
    }

    // ── Frame input ──────────────────────────────────────────────────────

    pub fn grab_monocular(&mut self, image: &Image, timestamp: Option<f64>) -> Matrix4<f64> {
        self.tracker.grab_monocular(image, timestamp)
    }

    pub fn grab_rgbd(
        &mut self,
        image: &Image,
        depth: &DepthImage,
        timestamp: Option<f64>,
    ) -> Matrix4<f64> {
        self.tracker.grab_rgbd(image, depth, timestamp)
    }

    pub fn grab_fusion(
        &mut self,
        image: &Image,
        dt: f64,
        imu: ImuSample,
        timestamp: Option<f64>,
    ) -> Matrix4<f64> {
        self.tracker.grab_fusion(image, dt, imu, timestamp)
    }

    // ── Control ──────────────────────────────────────────────────────────

    pub fn reset(&mut self) {
        self.tracker.reset();
    }

    pub fn inform_only_tracking(&mut self, flag: bool) {
        self.tracker.inform_only_tracking(flag);
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn map(&self) -> &Arc<Mutex<Map>> {
        &self.map
    }

    pub fn local_mapper(&self) -> &Arc<LocalMapper> {
        &self.local_mapper
    }

    /// Dump the per-frame relative poses (`T_cr`) recorded so far.
    pub fn save_trajectory<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        crate::io::trajectory::save(path, self.tracker.trajectory())
    }

    /// Stop the mapping thread and wait for it.
    pub fn shutdown(&mut self) {
        self.local_mapper.request_finish();
        if let Some(handle) = self.mapping_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SlamSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}
