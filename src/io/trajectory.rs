//! Trajectory dump.
//!
//! Writes the per-frame poses relative to their reference keyframes as a
//! YAML sequence. The dump is an export format only; the live map is never
//! reconstructed from it.

use std::path::Path;

use anyhow::{Context, Result};
use yaml_rust::yaml::{Array, Hash};
use yaml_rust::{Yaml, YamlEmitter};

use crate::tracking::RelativePose;

/// Serialize `entries` to `path`. Each record carries the frame id, the
/// reference keyframe id, and the row-major 4x4 `T_cr` matrix.
pub fn save<P: AsRef<Path>>(path: P, entries: &[RelativePose]) -> Result<()> {
    let mut records = Array::new();
    for entry in entries {
        let mut record = Hash::new();
        record.insert(
            Yaml::String("frame".into()),
            Yaml::Integer(entry.frame_id as i64),
        );
        record.insert(
            Yaml::String("reference_keyframe".into()),
            Yaml::Integer(entry.reference_kf.0 as i64),
        );

        let matrix = entry.pose.to_matrix();
        let mut values = Array::new();
        for row in 0..4 {
            for col in 0..4 {
                values.push(Yaml::Real(format!("{:.9}", matrix[(row, col)])));
            }
        }
        record.insert(Yaml::String("pose".into()), Yaml::Array(values));
        records.push(Yaml::Hash(record));
    }

    let mut out = String::new();
    YamlEmitter::new(&mut out)
        .dump(&Yaml::Array(records))
        .context("failed to serialize trajectory")?;
    out.push('\n');

    std::fs::write(path.as_ref(), out)
        .with_context(|| format!("failed to write {}", path.as_ref().display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::map::types::KeyFrameId;
    use nalgebra::{UnitQuaternion, Vector3};
    use yaml_rust::YamlLoader;

    #[test]
    fn test_save_and_parse_back() {
        let entries = vec![
            RelativePose {
                frame_id: 0,
                reference_kf: KeyFrameId(0),
                pose: SE3::identity(),
            },
            RelativePose {
                frame_id: 1,
                reference_kf: KeyFrameId(0),
                pose: SE3::new(
                    UnitQuaternion::from_euler_angles(0.0, 0.1, 0.0),
                    Vector3::new(0.25, 0.0, 0.0),
                ),
            },
        ];

        let path = std::env::temp_dir().join("sparse-vslam-trajectory-test.yaml");
        save(&path, &entries).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let docs = YamlLoader::load_from_str(&text).unwrap();
        let records = docs[0].as_vec().unwrap();
        assert_eq!(records.len(), 2);

        let second = records[1].as_hash().unwrap();
        assert_eq!(second[&Yaml::String("frame".into())].as_i64(), Some(1));
        let pose = second[&Yaml::String("pose".into())].as_vec().unwrap();
        assert_eq!(pose.len(), 16);
        // Row-major: translation x sits at index 3.
        assert!((pose[3].as_f64().unwrap() - 0.25).abs() < 1e-9);

        let _ = std::fs::remove_file(&path);
    }
}
