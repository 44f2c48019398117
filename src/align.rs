//! Direct image alignment interface.
//!
//! The dense photometric aligner is an external collaborator. The tracker
//! seeds the current frame's pose, asks the aligner for a refinement, and
//! falls back to the untouched seed when alignment fails.

use crate::geometry::SE3;
use crate::map::keyframe::KeyFrame;
use crate::tracking::frame::Frame;

pub trait ImageAligner: Send {
    /// Refine the current frame's pose against the previous frame.
    /// Returns the refined `T_cw`, or `None` when alignment diverged.
    fn align_to_frame(&self, current: &Frame, reference: &Frame) -> Option<SE3>;

    /// Refine against a keyframe. `coarse` requests the cheaper variant
    /// used while scanning relocalization candidates.
    fn align_to_keyframe(&self, current: &Frame, reference: &KeyFrame, coarse: bool)
        -> Option<SE3>;
}

/// Aligner that always declines: tracking then relies purely on the
/// matcher and the motion prior. Useful as a default and in tests.
pub struct DisabledAligner;

impl ImageAligner for DisabledAligner {
    fn align_to_frame(&self, _current: &Frame, _reference: &Frame) -> Option<SE3> {
        None
    }

    fn align_to_keyframe(
        &self,
        _current: &Frame,
        _reference: &KeyFrame,
        _coarse: bool,
    ) -> Option<SE3> {
        None
    }
}
