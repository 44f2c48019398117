//! Tracking state machine states.

/// State of the tracking front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingState {
    /// No frame has been received yet.
    #[default]
    NoImages,
    /// Frames are arriving but the map has not been bootstrapped.
    NotInitialized,
    /// Tracking normally.
    Ok,
    /// Tracking failed; relocalization runs on each new frame.
    Lost,
}

impl std::fmt::Display for TrackingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TrackingState::NoImages => "NO_IMAGES",
            TrackingState::NotInitialized => "NOT_INITIALIZED",
            TrackingState::Ok => "OK",
            TrackingState::Lost => "LOST",
        };
        f.write_str(name)
    }
}
