//! Local mapping interface and drain loop.
//!
//! The tracker only ever talks to the [`LocalMapper`] contract: a FIFO
//! keyframe queue plus a handful of control flags. Triangulation, local BA
//! and keyframe culling are the mapping thread's business; the drain loop
//! here consumes the queue and performs recent map point culling so the
//! shared map keeps its invariants under concurrent mutation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::debug;

use crate::map::map::Map;
use crate::map::types::KeyFrameId;

/// Quality floor for recent map points: below this found/visible ratio a
/// point is culled.
const MIN_FOUND_RATIO: f64 = 0.25;

/// Receive timeout so the loop can poll its control flags.
const RECV_TIMEOUT: Duration = Duration::from_millis(5);

/// Shared handle between the tracking thread and the mapping thread.
pub struct LocalMapper {
    queue_tx: Sender<KeyFrameId>,
    queue_rx: Receiver<KeyFrameId>,

    accept_keyframes: AtomicBool,
    stopped: AtomicBool,
    stop_requested: AtomicBool,
    /// While set, stop requests are deferred (a keyframe insertion is in
    /// flight).
    not_stop: AtomicBool,
    abort_ba: AtomicBool,
    reset_requested: AtomicBool,
    finish_requested: AtomicBool,
}

impl LocalMapper {
    pub fn new() -> Self {
        let (queue_tx, queue_rx) = unbounded();
        Self {
            queue_tx,
            queue_rx,
            accept_keyframes: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            not_stop: AtomicBool::new(false),
            abort_ba: AtomicBool::new(false),
            reset_requested: AtomicBool::new(false),
            finish_requested: AtomicBool::new(false),
        }
    }

    // ── Tracker-facing contract ──────────────────────────────────────────

    /// Enqueue a freshly admitted keyframe, in strict tracking order.
    pub fn insert_keyframe(&self, kf_id: KeyFrameId) {
        self.abort_ba.store(true, Ordering::SeqCst);
        let _ = self.queue_tx.send(kf_id);
    }

    pub fn keyframes_in_queue(&self) -> usize {
        self.queue_rx.len()
    }

    pub fn accept_keyframes(&self) -> bool {
        self.accept_keyframes.load(Ordering::SeqCst)
    }

    pub fn set_accept_keyframes(&self, value: bool) {
        self.accept_keyframes.store(value, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Ask the mapping loop to interrupt the in-flight bundle adjustment.
    pub fn interrupt_ba(&self) {
        self.abort_ba.store(true, Ordering::SeqCst);
    }

    pub fn ba_interrupted(&self) -> bool {
        self.abort_ba.load(Ordering::SeqCst)
    }

    /// Guard keyframe insertion against a concurrent stop. Returns false
    /// when a stop is already in effect or requested; the caller must then
    /// skip keyframe creation.
    pub fn set_not_stop(&self, flag: bool) -> bool {
        if flag && (self.is_stopped() || self.stop_requested()) {
            return false;
        }
        self.not_stop.store(flag, Ordering::SeqCst);
        true
    }

    pub fn request_reset(&self) {
        self.reset_requested.store(true, Ordering::SeqCst);
    }

    // ── Loop-closer / system-facing control ──────────────────────────────

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.abort_ba.store(true, Ordering::SeqCst);
    }

    /// Honor a pending stop request unless an insertion holds `not_stop`.
    /// Returns whether the loop is now stopped.
    pub fn apply_stop(&self) -> bool {
        if self.stop_requested() && !self.not_stop.load(Ordering::SeqCst) {
            self.stopped.store(true, Ordering::SeqCst);
            debug!("local mapping stopped");
        }
        self.is_stopped()
    }

    /// Resume after a stop.
    pub fn release(&self) {
        self.stopped.store(false, Ordering::SeqCst);
        self.stop_requested.store(false, Ordering::SeqCst);
        debug!("local mapping released");
    }

    pub fn request_finish(&self) {
        self.finish_requested.store(true, Ordering::SeqCst);
    }

    fn finish_requested(&self) -> bool {
        self.finish_requested.load(Ordering::SeqCst)
    }

    fn reset_if_requested(&self) {
        if self.reset_requested.swap(false, Ordering::SeqCst) {
            while self.queue_rx.try_recv().is_ok() {}
            self.abort_ba.store(false, Ordering::SeqCst);
            debug!("local mapping reset");
        }
    }

    // ── Mapping loop ─────────────────────────────────────────────────────

    /// Drain loop run on the mapping thread until `request_finish`.
    pub fn run(&self, map: Arc<Mutex<Map>>) {
        loop {
            if self.finish_requested() {
                break;
            }
            self.reset_if_requested();

            if self.apply_stop() {
                self.set_accept_keyframes(false);
                std::thread::sleep(Duration::from_millis(3));
                continue;
            }

            match self.queue_rx.recv_timeout(RECV_TIMEOUT) {
                Ok(kf_id) => {
                    self.set_accept_keyframes(false);
                    self.process_keyframe(kf_id, &map);
                    if self.keyframes_in_queue() == 0 {
                        self.set_accept_keyframes(true);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.set_accept_keyframes(true);
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.set_accept_keyframes(false);
    }

    fn process_keyframe(&self, kf_id: KeyFrameId, map: &Arc<Mutex<Map>>) {
        self.abort_ba.store(false, Ordering::SeqCst);

        let mut map = map.lock();
        if map.keyframe(kf_id).is_none() {
            return;
        }
        // Recent map point culling: orphans and points the tracker keeps
        // projecting but never matching.
        let culled = map.cull_map_points(MIN_FOUND_RATIO, 1);
        if culled > 0 {
            debug!(keyframe = %kf_id, culled, "culled low-quality map points");
        }
    }
}

impl Default for LocalMapper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_ordering() {
        let mapper = LocalMapper::new();
        mapper.insert_keyframe(KeyFrameId(0));
        mapper.insert_keyframe(KeyFrameId(1));
        assert_eq!(mapper.keyframes_in_queue(), 2);
        assert_eq!(mapper.queue_rx.recv().unwrap(), KeyFrameId(0));
        assert_eq!(mapper.queue_rx.recv().unwrap(), KeyFrameId(1));
    }

    #[test]
    fn test_insert_signals_ba_interrupt() {
        let mapper = LocalMapper::new();
        assert!(!mapper.ba_interrupted());
        mapper.insert_keyframe(KeyFrameId(0));
        assert!(mapper.ba_interrupted());
    }

    #[test]
    fn test_set_not_stop_refused_after_stop_request() {
        let mapper = LocalMapper::new();
        assert!(mapper.set_not_stop(true));
        assert!(mapper.set_not_stop(false));

        mapper.request_stop();
        assert!(!mapper.set_not_stop(true));

        mapper.release();
        assert!(mapper.set_not_stop(true));
    }

    #[test]
    fn test_not_stop_defers_stop() {
        let mapper = LocalMapper::new();
        assert!(mapper.set_not_stop(true));
        mapper.request_stop();
        assert!(!mapper.apply_stop());

        mapper.set_not_stop(false);
        assert!(mapper.apply_stop());
        assert!(mapper.is_stopped());
    }

    #[test]
    fn test_reset_drains_queue() {
        let mapper = LocalMapper::new();
        mapper.insert_keyframe(KeyFrameId(0));
        mapper.insert_keyframe(KeyFrameId(1));
        mapper.request_reset();
        mapper.reset_if_requested();
        assert_eq!(mapper.keyframes_in_queue(), 0);
        assert!(!mapper.ba_interrupted());
    }
}
