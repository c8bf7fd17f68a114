//! Meter lifecycle state machine
//!
//! All mutable state lives in one [`MeterState`] behind a single async mutex,
//! shared by caller-initiated operations, the sampler task and the
//! interruption observer. Device calls run on the blocking pool. Queries read
//! a published status snapshot and never wait for the mutex.

use super::interruption::{InterruptionCenter, InterruptionEvent};
use super::sampler::Sampler;
use super::subscriber::Subscriber;
use super::MeterConfig;
use crate::audio::{level, CaptureBackend, CaptureError, CaptureStream};
use crate::ipc::ErrorPayload;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::{self, JoinHandle};

/// Meter errors, as reported to the host
#[derive(Error, Debug)]
pub enum MeterError {
    #[error("DBMeter is not initialized")]
    NotInitialized,

    #[error("DBMeter is not listening")]
    NotListening,

    #[error("Error while initializing DBMeter")]
    ResourceInit(#[source] CaptureError),

    #[error("Audio capture error: {0}")]
    Capture(#[source] CaptureError),
}

impl MeterError {
    /// Wire code sent in the error payload
    pub fn code(&self) -> i32 {
        match self {
            MeterError::NotInitialized | MeterError::ResourceInit(_) => 0,
            MeterError::NotListening => 1,
            MeterError::Capture(_) => 2,
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterPhase {
    /// No capture resource
    Uninitialized,
    /// Resource allocated, not sampling
    Idle,
    /// Resource allocated and sampling
    Listening,
    /// Forced out of Listening by a system interruption
    Interrupted,
}

impl MeterPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeterPhase::Uninitialized => "uninitialized",
            MeterPhase::Idle => "idle",
            MeterPhase::Listening => "listening",
            MeterPhase::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MeterStatus {
    phase: MeterPhase,
    interrupted: bool,
}

impl Default for MeterStatus {
    fn default() -> Self {
        Self {
            phase: MeterPhase::Uninitialized,
            interrupted: false,
        }
    }
}

struct MeterState<S> {
    stream: Option<S>,
    sampler: Option<Sampler>,
    subscriber: Option<Subscriber>,
    listening: bool,
    interrupted: bool,
    status: watch::Sender<MeterStatus>,
}

impl<S: CaptureStream + 'static> MeterState<S> {
    fn new(status: watch::Sender<MeterStatus>) -> Self {
        Self {
            stream: None,
            sampler: None,
            subscriber: None,
            listening: false,
            interrupted: false,
            status,
        }
    }

    fn phase(&self) -> MeterPhase {
        if self.listening {
            MeterPhase::Listening
        } else if self.stream.is_none() {
            MeterPhase::Uninitialized
        } else if self.interrupted {
            MeterPhase::Interrupted
        } else {
            MeterPhase::Idle
        }
    }

    /// Makes the current state visible to queries
    fn publish(&self) {
        let status = MeterStatus {
            phase: self.phase(),
            interrupted: self.interrupted,
        };
        let previous = self.status.send_replace(status);
        if previous.phase != status.phase {
            tracing::debug!(
                "Meter phase: {} -> {}",
                previous.phase.as_str(),
                status.phase.as_str()
            );
        }
    }

    /// Runs a blocking stream call on the blocking pool. No-op without a stream.
    async fn run_on_stream(
        &mut self,
        op: fn(&mut S) -> Result<(), CaptureError>,
    ) -> Result<(), CaptureError> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };

        let (stream, result) = task::spawn_blocking(move || {
            let result = op(&mut stream);
            (stream, result)
        })
        .await
        .map_err(|e| CaptureError::StreamError(e.to_string()))?;

        self.stream = Some(stream);
        result
    }

    async fn begin_listening(&mut self) -> Result<(), CaptureError> {
        if self.listening {
            return Ok(());
        }
        self.run_on_stream(|stream| stream.record()).await?;
        if let Some(sampler) = &self.sampler {
            sampler.resume();
        }
        self.listening = true;
        Ok(())
    }

    /// Leaves Listening without touching the capture stream
    fn suspend_sampling(&mut self) {
        if self.listening {
            if let Some(sampler) = &self.sampler {
                sampler.suspend();
            }
            self.listening = false;
        }
    }

    async fn halt_capture(&mut self) -> Result<(), CaptureError> {
        self.run_on_stream(|stream| {
            if stream.is_recording() {
                stream.stop()
            } else {
                Ok(())
            }
        })
        .await
    }

    async fn interrupt(&mut self) {
        self.interrupted = true;
        if self.listening {
            self.suspend_sampling();
            if let Err(e) = self.halt_capture().await {
                tracing::error!("Failed to halt capture on interruption: {}", e);
            }
            tracing::warn!("Audio interruption began, sampling suspended");
        } else {
            tracing::warn!("Audio interruption began");
        }
        self.publish();
    }

    fn tick(&mut self) {
        if !self.listening {
            return;
        }
        let Some(stream) = self.stream.as_mut() else {
            return;
        };

        stream.update_meters();
        let level = level::sound_level(stream.peak_power(0));
        tracing::debug!("Sound level: {}", level);

        if let Some(subscriber) = &self.subscriber {
            subscriber.send_reading(level);
        }
    }
}

async fn release_stream<S: CaptureStream + 'static>(stream: S) {
    if let Err(e) = task::spawn_blocking(move || drop(stream)).await {
        tracing::warn!("Capture release did not complete: {}", e);
    }
}

/// Controls one capture resource and streams its level to one subscriber
pub struct MeterController<B: CaptureBackend> {
    backend: Arc<B>,
    config: MeterConfig,
    state: Arc<Mutex<MeterState<B::Stream>>>,
    status: watch::Receiver<MeterStatus>,
    interruptions: InterruptionCenter,
    observer: OnceLock<JoinHandle<()>>,
}

impl<B: CaptureBackend> MeterController<B> {
    pub fn new(backend: B, interruptions: InterruptionCenter) -> Self {
        Self::with_config(backend, interruptions, MeterConfig::default())
    }

    pub fn with_config(backend: B, interruptions: InterruptionCenter, config: MeterConfig) -> Self {
        let (status_tx, status) = watch::channel(MeterStatus::default());
        Self {
            backend: Arc::new(backend),
            config,
            state: Arc::new(Mutex::new(MeterState::new(status_tx))),
            status,
            interruptions,
            observer: OnceLock::new(),
        }
    }

    /// Registers the interruption observer. Only the first call subscribes.
    pub fn listen_to_interruptions(&self) {
        self.observer.get_or_init(|| {
            let mut events = self.interruptions.subscribe();
            let state = Arc::downgrade(&self.state);

            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(InterruptionEvent::Began) => {
                            let Some(state) = state.upgrade() else {
                                break;
                            };
                            state.lock().await.interrupt().await;
                        }
                        Ok(InterruptionEvent::Ended) => {
                            tracing::debug!("Audio interruption ended");
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!("Missed {} interruption events", missed);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        });
    }

    /// Starts listening and streams readings to `subscriber`.
    ///
    /// Failures are also reported to the subscriber. Calling `start` while
    /// listening only replaces the subscriber.
    pub async fn start(&self, subscriber: Subscriber) -> Result<(), MeterError> {
        self.listen_to_interruptions();

        let mut state = self.state.lock().await;
        let result = self.start_locked(&mut state, &subscriber).await;
        state.publish();

        match &result {
            Ok(()) => tracing::info!("Meter listening (callback {})", subscriber.callback_id()),
            Err(error) => subscriber.send_error(error),
        }
        result
    }

    async fn start_locked(
        &self,
        state: &mut MeterState<B::Stream>,
        subscriber: &Subscriber,
    ) -> Result<(), MeterError> {
        state.subscriber = Some(subscriber.clone());

        if state.sampler.is_none() || state.interrupted {
            state.sampler = Some(self.spawn_sampler());
        }

        if state.stream.is_none() {
            let stream = self.open_stream().await.map_err(|e| {
                tracing::error!("Failed to acquire capture resource: {}", e);
                MeterError::ResourceInit(e)
            })?;
            tracing::info!("Capture resource acquired");
            state.stream = Some(stream);
        }

        state.begin_listening().await.map_err(|e| {
            tracing::error!("Failed to start capture: {}", e);
            MeterError::ResourceInit(e)
        })?;

        if state.interrupted {
            state.interrupted = false;
            tracing::info!("Resumed after interruption");
        }
        Ok(())
    }

    /// Suspends sampling and halts capture. The resource stays allocated.
    pub async fn stop(&self) -> Result<(), MeterError> {
        let mut state = self.state.lock().await;
        if !state.listening {
            return Err(MeterError::NotListening);
        }

        state.suspend_sampling();
        let halted = state.halt_capture().await;
        state.publish();
        halted.map_err(MeterError::Capture)?;

        tracing::info!("Meter stopped");
        Ok(())
    }

    /// Releases the capture resource and the sampler
    pub async fn destroy(&self) -> Result<(), MeterError> {
        let mut state = self.state.lock().await;
        state.suspend_sampling();
        state.subscriber = None;
        state.sampler = None;

        if let Err(e) = state.halt_capture().await {
            tracing::warn!("Failed to halt capture before release: {}", e);
        }

        let stream = state.stream.take();
        state.publish();

        match stream {
            Some(stream) => {
                release_stream(stream).await;
                tracing::info!("Capture resource released");
                Ok(())
            }
            None => Err(MeterError::NotInitialized),
        }
    }

    pub fn is_listening(&self) -> bool {
        self.status.borrow().phase == MeterPhase::Listening
    }

    pub fn is_interrupted(&self) -> bool {
        self.status.borrow().interrupted
    }

    pub fn phase(&self) -> MeterPhase {
        self.status.borrow().phase
    }

    async fn open_stream(&self) -> Result<B::Stream, CaptureError> {
        let backend = Arc::clone(&self.backend);
        let audio = self.config.audio.clone();
        task::spawn_blocking(move || backend.open(&audio))
            .await
            .unwrap_or_else(|e| Err(CaptureError::StreamError(e.to_string())))
    }

    fn spawn_sampler(&self) -> Sampler {
        let state = Arc::downgrade(&self.state);
        Sampler::spawn(self.config.timing, move || {
            let state = state.clone();
            async move {
                if let Some(state) = state.upgrade() {
                    state.lock().await.tick();
                }
            }
        })
    }
}

impl<B: CaptureBackend> Drop for MeterController<B> {
    fn drop(&mut self) {
        if let Some(observer) = self.observer.get() {
            observer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{MockCaptureBackend, MockCaptureStream};
    use crate::ipc::{Payload, PluginResponse, ResultSender};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::mpsc::{error::TryRecvError, UnboundedReceiver};
    use tokio::time::{sleep, Duration};

    /// A stream that records successfully; `records` bounds the `record` calls
    fn fake_stream(peak_db: f32, records: Option<usize>) -> MockCaptureStream {
        let recording = Arc::new(AtomicBool::new(false));
        let mut stream = MockCaptureStream::new();

        let flag = Arc::clone(&recording);
        let record = stream.expect_record();
        if let Some(times) = records {
            record.times(times);
        }
        record.returning(move || {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        let flag = Arc::clone(&recording);
        stream.expect_stop().returning(move || {
            flag.store(false, Ordering::SeqCst);
            Ok(())
        });
        let flag = Arc::clone(&recording);
        stream
            .expect_is_recording()
            .returning(move || flag.load(Ordering::SeqCst));
        stream.expect_update_meters().return_const(());
        stream.expect_peak_power().return_const(peak_db);
        stream
    }

    fn backend_with<F>(opens: usize, make_stream: F) -> MockCaptureBackend
    where
        F: Fn() -> MockCaptureStream + Send + 'static,
    {
        let mut backend = MockCaptureBackend::new();
        backend
            .expect_open()
            .times(opens)
            .returning(move |_| Ok(make_stream()));
        backend
    }

    fn backend(opens: usize, peak_db: f32) -> MockCaptureBackend {
        backend_with(opens, move || fake_stream(peak_db, None))
    }

    fn controller(
        backend: MockCaptureBackend,
    ) -> (MeterController<MockCaptureBackend>, InterruptionCenter) {
        let interruptions = InterruptionCenter::new();
        (MeterController::new(backend, interruptions.clone()), interruptions)
    }

    fn subscriber(id: &str) -> (Subscriber, UnboundedReceiver<PluginResponse>) {
        let (results, rx) = ResultSender::channel();
        (Subscriber::new(id, results), rx)
    }

    #[tokio::test]
    async fn stop_while_idle_is_not_listening() {
        let (meter, _) = controller(backend(0, -40.0));

        let err = meter.stop().await.unwrap_err();
        assert!(matches!(err, MeterError::NotListening));
        assert_eq!(err.code(), 1);
        assert_eq!(err.to_string(), "DBMeter is not listening");
    }

    #[tokio::test]
    async fn destroy_without_resource_is_not_initialized() {
        let (meter, _) = controller(backend(0, -40.0));

        let err = meter.destroy().await.unwrap_err();
        assert!(matches!(err, MeterError::NotInitialized));
        assert_eq!(err.code(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_stop_destroy_lifecycle() {
        let (meter, _) = controller(backend(1, -40.0));
        let (sub, _rx) = subscriber("cb-1");
        assert_eq!(meter.phase(), MeterPhase::Uninitialized);

        meter.start(sub).await.unwrap();
        assert!(meter.is_listening());
        assert_eq!(meter.phase(), MeterPhase::Listening);

        meter.stop().await.unwrap();
        assert!(!meter.is_listening());
        assert_eq!(meter.phase(), MeterPhase::Idle);
        assert!(matches!(meter.stop().await, Err(MeterError::NotListening)));

        meter.destroy().await.unwrap();
        assert!(!meter.is_listening());
        assert_eq!(meter.phase(), MeterPhase::Uninitialized);
        assert!(matches!(meter.destroy().await, Err(MeterError::NotInitialized)));
    }

    #[tokio::test(start_paused = true)]
    async fn readings_stream_to_the_subscriber() {
        let (meter, _) = controller(backend(1, -40.0));
        let (sub, mut rx) = subscriber("cb-1");
        meter.start(sub).await.unwrap();

        for _ in 0..3 {
            let response = rx.recv().await.unwrap();
            assert_eq!(response.callback_id, "cb-1");
            assert!(response.result.is_ok());
            assert!(response.result.keep_callback);
            assert_eq!(response.result.payload, Some(Payload::Level(50)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_reading_arrives_after_warmup() {
        let (meter, _) = controller(backend(1, 0.0));
        let (sub, mut rx) = subscriber("cb-1");
        meter.start(sub).await.unwrap();

        sleep(Duration::from_millis(200)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        sleep(Duration::from_millis(200)).await;
        let response = rx.try_recv().unwrap();
        assert_eq!(response.result.payload, Some(Payload::Level(90)));
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_reuses_resource_and_replaces_subscriber() {
        let (meter, _) = controller(backend_with(1, || fake_stream(-40.0, Some(1))));
        let (results, mut rx) = ResultSender::channel();

        meter.start(Subscriber::new("cb-1", results.clone())).await.unwrap();
        meter.start(Subscriber::new("cb-2", results)).await.unwrap();

        let response = rx.recv().await.unwrap();
        assert_eq!(response.callback_id, "cb-2");

        // one stream only: nothing else before the next period
        sleep(Duration::from_secs(5)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_suspends_readings_and_start_resumes_them() {
        let (meter, _) = controller(backend(1, -40.0));
        let (sub, mut rx) = subscriber("cb-1");
        meter.start(sub.clone()).await.unwrap();
        rx.recv().await.unwrap();

        meter.stop().await.unwrap();
        sleep(Duration::from_secs(60)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        meter.start(sub).await.unwrap();
        let response = rx.recv().await.unwrap();
        assert_eq!(response.result.payload, Some(Payload::Level(50)));
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_releases_and_next_start_reacquires() {
        let (meter, _) = controller(backend(2, -40.0));
        let (sub, mut rx) = subscriber("cb-1");

        meter.start(sub.clone()).await.unwrap();
        meter.destroy().await.unwrap();

        sleep(Duration::from_secs(30)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        meter.start(sub).await.unwrap();
        assert!(meter.is_listening());
        assert!(rx.recv().await.unwrap().result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn acquisition_failure_is_reported_to_subscriber() {
        let mut backend = MockCaptureBackend::new();
        backend
            .expect_open()
            .times(1)
            .returning(|_| Err(CaptureError::NoDevice));
        let (meter, _) = controller(backend);
        let (sub, mut rx) = subscriber("cb-1");

        let err = meter.start(sub).await.unwrap_err();
        assert!(matches!(err, MeterError::ResourceInit(_)));
        assert!(!meter.is_listening());

        let response = rx.recv().await.unwrap();
        assert!(!response.result.is_ok());
        assert_eq!(
            response.result.payload,
            Some(Payload::Error(ErrorPayload {
                code: 0,
                message: "Error while initializing DBMeter".into(),
            }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn record_failure_keeps_the_interruption_flag() {
        let calls = Arc::new(AtomicUsize::new(0));
        let record_calls = Arc::clone(&calls);
        let (meter, interruptions) = controller(backend_with(1, move || {
            let calls = Arc::clone(&record_calls);
            let mut stream = MockCaptureStream::new();
            stream.expect_record().returning(move || {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(())
                } else {
                    Err(CaptureError::StreamError("device busy".into()))
                }
            });
            stream.expect_is_recording().return_const(true);
            stream.expect_stop().returning(|| Ok(()));
            stream
        }));
        let (sub, mut rx) = subscriber("cb-1");

        meter.start(sub.clone()).await.unwrap();
        interruptions.post(InterruptionEvent::Began);
        sleep(Duration::from_millis(1)).await;
        assert!(meter.is_interrupted());

        let err = meter.start(sub).await.unwrap_err();
        assert!(matches!(err, MeterError::ResourceInit(_)));
        assert!(meter.is_interrupted());
        assert!(!meter.is_listening());
        assert_eq!(meter.phase(), MeterPhase::Interrupted);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let response = rx.recv().await.unwrap();
        match response.result.payload {
            Some(Payload::Error(payload)) => assert_eq!(payload.code, 0),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_reports_capture_failure_with_code_2() {
        let (meter, _) = controller(backend_with(1, || {
            let mut stream = MockCaptureStream::new();
            stream.expect_record().returning(|| Ok(()));
            stream.expect_is_recording().return_const(true);
            stream
                .expect_stop()
                .returning(|| Err(CaptureError::StreamError("device lost".into())));
            stream
        }));
        let (sub, _rx) = subscriber("cb-1");
        meter.start(sub).await.unwrap();

        let err = meter.stop().await.unwrap_err();
        assert!(matches!(err, MeterError::Capture(_)));
        assert_eq!(err.code(), 2);
        assert!(!meter.is_listening());
        assert_eq!(meter.phase(), MeterPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn interruption_suspends_until_next_start() {
        let (meter, interruptions) = controller(backend(1, -40.0));
        let (sub, mut rx) = subscriber("cb-1");
        meter.start(sub.clone()).await.unwrap();
        assert!(!meter.is_interrupted());

        assert_eq!(interruptions.post(InterruptionEvent::Began), 1);
        sleep(Duration::from_millis(1)).await;

        assert!(meter.is_interrupted());
        assert!(!meter.is_listening());
        assert_eq!(meter.phase(), MeterPhase::Interrupted);

        sleep(Duration::from_secs(30)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        // ended does not clear the flag
        interruptions.post(InterruptionEvent::Ended);
        sleep(Duration::from_millis(1)).await;
        assert!(meter.is_interrupted());

        meter.start(sub).await.unwrap();
        assert!(!meter.is_interrupted());
        assert!(meter.is_listening());
        assert_eq!(rx.recv().await.unwrap().result.payload, Some(Payload::Level(50)));
    }

    #[tokio::test]
    async fn interruption_observer_registers_once() {
        let (meter, interruptions) = controller(backend(0, -40.0));
        assert_eq!(interruptions.observer_count(), 0);

        meter.listen_to_interruptions();
        meter.listen_to_interruptions();
        assert_eq!(interruptions.observer_count(), 1);
    }

    #[tokio::test]
    async fn dropping_the_controller_stops_observing() {
        let (meter, interruptions) = controller(backend(0, -40.0));
        meter.listen_to_interruptions();
        assert_eq!(interruptions.observer_count(), 1);

        drop(meter);
        for _ in 0..10 {
            task::yield_now().await;
        }
        assert_eq!(interruptions.observer_count(), 0);
    }

    #[tokio::test]
    async fn slow_device_open_does_not_block_queries() {
        let (meter, _) = controller(backend_with(1, || {
            std::thread::sleep(std::time::Duration::from_millis(500));
            fake_stream(-40.0, None)
        }));
        let meter = Arc::new(meter);
        let (sub, _rx) = subscriber("cb-1");

        let starting = tokio::spawn({
            let meter = Arc::clone(&meter);
            async move { meter.start(sub).await }
        });

        let before = std::time::Instant::now();
        sleep(Duration::from_millis(50)).await;
        assert!(before.elapsed() < std::time::Duration::from_millis(300));
        assert!(!meter.is_listening());
        assert_eq!(meter.phase(), MeterPhase::Uninitialized);
        assert!(!starting.is_finished());

        starting.await.unwrap().unwrap();
        assert!(meter.is_listening());
    }
}
