//! Per-camera detection worker.
//!
//! Pulls frames off the camera's queue, throttles recognition to one frame per
//! `detection_interval` of capture time, and hands confident results to the handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;

use crate::config::Tunables;
use crate::detect::backend::Recognizer;
use crate::detect::result::{DetectionEvent, DetectionHandler};
use crate::frame::{FrameQueue, FrameSample};
use crate::stats::CameraStatsCell;
use crate::Timestamp;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WorkerSettings {
    pub detection_interval: Duration,
    pub min_confidence_threshold: f32,
    pub pop_timeout: Duration,
}

impl From<&Tunables> for WorkerSettings {
    fn from(t: &Tunables) -> Self {
        Self {
            detection_interval: t.detection_interval,
            min_confidence_threshold: t.min_confidence_threshold,
            pop_timeout: t.queue_pop_timeout,
        }
    }
}

pub struct DetectionWorker {
    camera_id: String,
    queue: Arc<FrameQueue>,
    recognizer: Arc<dyn Recognizer>,
    handler: Arc<dyn DetectionHandler>,
    stats: Arc<CameraStatsCell>,
    settings: WorkerSettings,
    stop: Arc<AtomicBool>,
    last_recognized_at: Option<Timestamp>,
}

impl DetectionWorker {
    pub fn new(
        camera_id: &str,
        queue: Arc<FrameQueue>,
        recognizer: Arc<dyn Recognizer>,
        handler: Arc<dyn DetectionHandler>,
        stats: Arc<CameraStatsCell>,
        settings: WorkerSettings,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            queue,
            recognizer,
            handler,
            stats,
            settings,
            stop,
            last_recognized_at: None,
        }
    }

    pub fn spawn(self) -> Result<JoinHandle<()>> {
        let handle = std::thread::Builder::new()
            .name(format!("detect-{}", self.camera_id))
            .spawn(move || self.run())?;
        Ok(handle)
    }

    /// Worker loop. Returns once stopped or once the queue is closed and drained.
    pub fn run(mut self) {
        log::info!("DetectionWorker[{}]: started", self.camera_id);
        while !self.stop.load(Ordering::SeqCst) {
            match self.queue.pop_timeout(self.settings.pop_timeout) {
                Some(frame) => {
                    self.process_frame(&frame);
                }
                None if self.queue.is_closed() => break,
                None => {}
            }
        }
        log::info!("DetectionWorker[{}]: stopped", self.camera_id);
    }

    /// Run one frame through the throttle and the recognizer.
    ///
    /// Returns the emitted event, if any.
    pub fn process_frame(&mut self, frame: &FrameSample) -> Option<DetectionEvent> {
        if let Some(last) = self.last_recognized_at {
            // A frame older than the last recognized one means the clock stepped back;
            // it restarts the interval instead of being skipped.
            if frame.timestamp >= last
                && frame.timestamp.duration_since(last) < self.settings.detection_interval
            {
                self.stats.record_skipped();
                return None;
            }
        }
        self.last_recognized_at = Some(frame.timestamp);

        let recognition = match self.recognizer.recognize(frame, &self.camera_id) {
            Ok(Some(recognition)) => recognition,
            Ok(None) => return None,
            Err(err) => {
                log::debug!(
                    "DetectionWorker[{}]: recognizer {} failed on frame {}: {}",
                    self.camera_id,
                    self.recognizer.name(),
                    frame.sequence_no,
                    err
                );
                return None;
            }
        };

        if recognition.confidence.is_nan()
            || recognition.confidence < self.settings.min_confidence_threshold
        {
            log::debug!(
                "DetectionWorker[{}]: skipping low confidence: {:.2} < {:.2}",
                self.camera_id,
                recognition.confidence,
                self.settings.min_confidence_threshold
            );
            return None;
        }

        let event = DetectionEvent {
            camera_id: self.camera_id.clone(),
            timestamp: frame.timestamp,
            employee_id: recognition.employee_id,
            confidence: recognition.confidence,
            bounding_box: recognition.bounding_box,
        };
        self.stats.record_detection(event.timestamp);
        self.handler.handle(event.clone());
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::result::{BoundingBox, Recognition};
    use anyhow::anyhow;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct FixedRecognizer {
        calls: AtomicUsize,
        confidence: f32,
        fail: bool,
    }

    impl FixedRecognizer {
        fn new(confidence: f32) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                confidence,
                fail: false,
            }
        }
    }

    impl Recognizer for FixedRecognizer {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn recognize(&self, _frame: &FrameSample, _camera_id: &str) -> Result<Option<Recognition>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow!("model not loaded"));
            }
            Ok(Some(Recognition {
                employee_id: Some("EMP1".to_string()),
                confidence: self.confidence,
                bounding_box: BoundingBox::new(0.1, 0.1, 0.2, 0.2),
            }))
        }
    }

    #[derive(Default)]
    struct Collect {
        events: Mutex<Vec<DetectionEvent>>,
    }

    impl DetectionHandler for Collect {
        fn handle(&self, event: DetectionEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            detection_interval: Duration::from_secs(2),
            min_confidence_threshold: 0.6,
            pop_timeout: Duration::from_millis(20),
        }
    }

    fn worker(
        recognizer: Arc<FixedRecognizer>,
        handler: Arc<Collect>,
    ) -> (DetectionWorker, Arc<FrameQueue>, Arc<CameraStatsCell>, Arc<AtomicBool>) {
        let queue = Arc::new(FrameQueue::new(8));
        let stats = Arc::new(CameraStatsCell::new());
        let stop = Arc::new(AtomicBool::new(false));
        let worker = DetectionWorker::new(
            "cam_test",
            queue.clone(),
            recognizer,
            handler,
            stats.clone(),
            settings(),
            stop.clone(),
        );
        (worker, queue, stats, stop)
    }

    fn frame_at(secs: f64, seq: u64) -> FrameSample {
        FrameSample::new("cam_test", Timestamp::from_secs_f64(secs), seq, 2, 2, vec![0; 12])
    }

    #[test]
    fn detection_interval_throttles_recognition() {
        let recognizer = Arc::new(FixedRecognizer::new(0.9));
        let handler = Arc::new(Collect::default());
        let (mut worker, _, stats, _) = worker(recognizer.clone(), handler.clone());

        for (seq, secs) in [0.0, 0.5, 1.0, 2.0, 2.5, 4.1].into_iter().enumerate() {
            worker.process_frame(&frame_at(secs, seq as u64));
        }

        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 3);
        let events = handler.events.lock().unwrap();
        let times: Vec<i64> = events.iter().map(|e| e.timestamp.as_millis()).collect();
        assert_eq!(times, vec![0, 2000, 4100]);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.frames_skipped, 3);
        assert_eq!(snapshot.detection_count, 3);
        assert_eq!(snapshot.last_detection_time, Some(Timestamp::from_millis(4100)));
    }

    #[test]
    fn low_confidence_results_are_dropped() {
        let recognizer = Arc::new(FixedRecognizer::new(0.4));
        let handler = Arc::new(Collect::default());
        let (mut worker, _, stats, _) = worker(recognizer, handler.clone());

        assert!(worker.process_frame(&frame_at(0.0, 0)).is_none());
        assert!(handler.events.lock().unwrap().is_empty());
        assert_eq!(stats.snapshot().detection_count, 0);
    }

    #[test]
    fn nan_confidence_is_dropped() {
        let recognizer = Arc::new(FixedRecognizer::new(f32::NAN));
        let handler = Arc::new(Collect::default());
        let (mut worker, _, stats, _) = worker(recognizer.clone(), handler.clone());

        assert!(worker.process_frame(&frame_at(0.0, 0)).is_none());
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 1);
        assert!(handler.events.lock().unwrap().is_empty());
        assert_eq!(stats.snapshot().detection_count, 0);
    }

    #[test]
    fn clock_step_back_restarts_interval() {
        let recognizer = Arc::new(FixedRecognizer::new(0.9));
        let handler = Arc::new(Collect::default());
        let (mut worker, _, stats, _) = worker(recognizer, handler.clone());

        assert!(worker.process_frame(&frame_at(10_000.0, 0)).is_some());
        // Clock corrected backwards by over an hour.
        for (i, secs) in [6_400.0, 6_401.0, 6_402.0, 6_404.5].into_iter().enumerate() {
            worker.process_frame(&frame_at(secs, i as u64 + 1));
        }

        let events = handler.events.lock().unwrap();
        let times: Vec<i64> = events.iter().map(|e| e.timestamp.as_millis()).collect();
        assert_eq!(times, vec![10_000_000, 6_400_000, 6_402_000, 6_404_500]);
        assert_eq!(stats.snapshot().frames_skipped, 1);
    }

    #[test]
    fn recognizer_errors_produce_no_event() {
        let recognizer = Arc::new(FixedRecognizer {
            fail: true,
            ..FixedRecognizer::new(0.9)
        });
        let handler = Arc::new(Collect::default());
        let (mut worker, _, stats, _) = worker(recognizer, handler.clone());

        assert!(worker.process_frame(&frame_at(0.0, 0)).is_none());
        assert!(handler.events.lock().unwrap().is_empty());
        assert_eq!(stats.snapshot().error_count, 0);
    }

    #[test]
    fn worker_thread_drains_queue_and_stops() -> Result<()> {
        let recognizer = Arc::new(FixedRecognizer::new(0.9));
        let handler = Arc::new(Collect::default());
        let (worker, queue, _, stop) = worker(recognizer, handler.clone());

        queue.push(frame_at(0.0, 0));
        queue.push(frame_at(3.0, 1));
        let handle = worker.spawn()?;

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while handler.events.lock().unwrap().len() < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        stop.store(true, Ordering::SeqCst);
        handle.join().map_err(|_| anyhow!("worker panicked"))?;

        assert_eq!(handler.events.lock().unwrap().len(), 2);
        Ok(())
    }
}
