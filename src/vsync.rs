//! Vertical blank timing.
//!
//! A [`VSyncWorker`] runs one thread per display that waits for vblanks and reports their
//! timestamps. When the device cannot deliver vblank events, it sleeps to synthetic deadlines
//! that stay in phase with the last reported timestamp.

use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::kms::KmsDevice;
use crate::utils::{get_monotonic_time, sleep_until};

/// Refresh interval used when the mode does not give one.
pub const FALLBACK_REFRESH: Duration = Duration::from_nanos(16_666_667);

/// Called from the worker thread with the display and the vblank timestamp.
pub type VSyncCallback = Box<dyn FnMut(u32, Duration) + Send>;

#[derive(Debug)]
struct State {
    enabled: bool,
    exit: bool,
    last_timestamp: Option<Duration>,
    refresh: Duration,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

pub struct VSyncWorker {
    display: u32,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl VSyncWorker {
    /// Start a disabled worker for the CRTC with pipe index `pipe`.
    pub fn new(
        device: Arc<dyn KmsDevice>,
        display: u32,
        pipe: u32,
        refresh: Duration,
        callback: VSyncCallback,
    ) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                enabled: false,
                exit: false,
                last_timestamp: None,
                refresh: sanitize_refresh(refresh),
            }),
            cond: Condvar::new(),
        });

        let thread = thread::Builder::new()
            .name(format!("vsync-{display}"))
            .spawn({
                let shared = shared.clone();
                move || run(device, shared, display, pipe, callback)
            })?;

        Ok(Self {
            display,
            shared,
            thread: Some(thread),
        })
    }

    pub fn display(&self) -> u32 {
        self.display
    }

    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.shared.state.lock().unwrap();
        if state.enabled != enabled {
            trace!("display {}: vsync enabled: {enabled}", self.display);
            state.enabled = enabled;
            self.shared.cond.notify_all();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.state.lock().unwrap().enabled
    }

    /// Use a new refresh interval for synthetic vblanks, after a modeset.
    pub fn set_refresh_interval(&self, refresh: Duration) {
        let mut state = self.shared.state.lock().unwrap();
        state.refresh = sanitize_refresh(refresh);
        self.shared.cond.notify_all();
    }

    /// Get the timestamp of the last reported vblank.
    pub fn last_timestamp(&self) -> Option<Duration> {
        self.shared.state.lock().unwrap().last_timestamp
    }
}

impl Drop for VSyncWorker {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.exit = true;
            self.shared.cond.notify_all();
        }

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("display {}: vsync thread panicked", self.display);
            }
        }
    }
}

fn sanitize_refresh(refresh: Duration) -> Duration {
    if refresh.is_zero() {
        FALLBACK_REFRESH
    } else {
        refresh
    }
}

/// The first vblank after `now` of a display with period `frame` that had one at `last`.
pub fn phased_vsync(now: Duration, last: Option<Duration>, frame: Duration) -> Duration {
    let Some(last) = last else {
        return now + frame;
    };
    if now < last || frame.is_zero() {
        return last + frame;
    }

    let frame_ns = frame.as_nanos();
    let periods = (now - last).as_nanos() / frame_ns + 1;
    let offset = periods * frame_ns;
    last + Duration::new(
        (offset / 1_000_000_000) as u64,
        (offset % 1_000_000_000) as u32,
    )
}

fn run(
    device: Arc<dyn KmsDevice>,
    shared: Arc<Shared>,
    id: u32,
    pipe: u32,
    mut callback: VSyncCallback,
) {
    let _span = tracy_client::span!("vsync");

    let mut hw_vblank = true;
    loop {
        let (last, refresh) = {
            let mut state = shared.state.lock().unwrap();
            while !state.enabled && !state.exit {
                state = shared.cond.wait(state).unwrap();
            }
            if state.exit {
                break;
            }
            (state.last_timestamp, state.refresh)
        };

        let timestamp = if hw_vblank {
            match device.wait_vblank(pipe) {
                Ok(ts) => Some(ts),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!("display {id}: no vblank events, using synthetic vsync: {err}");
                    hw_vblank = false;
                    synthetic_vblank(&shared, last, refresh)
                }
            }
        } else {
            synthetic_vblank(&shared, last, refresh)
        };

        let Some(timestamp) = timestamp else {
            continue;
        };

        {
            let mut state = shared.state.lock().unwrap();
            if !state.enabled || state.exit {
                continue;
            }
            state.last_timestamp = Some(timestamp);
        }

        callback(id, timestamp);
    }

    trace!("display {id}: vsync thread exiting");
}

/// Sleep until the next phased deadline.
///
/// Returns `None` when disabling or shutdown cut the sleep short.
fn synthetic_vblank(shared: &Shared, last: Option<Duration>, refresh: Duration) -> Option<Duration> {
    let deadline = phased_vsync(get_monotonic_time(), last, refresh);

    {
        let state = shared.state.lock().unwrap();
        let timeout = deadline.saturating_sub(get_monotonic_time());
        let (state, _) = shared
            .cond
            .wait_timeout_while(state, timeout, |s| s.enabled && !s.exit)
            .unwrap();
        if !state.enabled || state.exit {
            return None;
        }
    }

    // The condvar runs on its own clock, finish on the monotonic one.
    loop {
        match sleep_until(deadline) {
            Ok(()) => break,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!("error sleeping until vblank: {err}");
                break;
            }
        }
    }

    Some(deadline)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::mpsc;
    use std::time::Instant;

    use super::*;
    use crate::kms::virt::{HardwareDesc, VirtualDevice};
    use crate::kms::{
        AtomicRequest, BlobId, CommitFlags, ConnectorId, CrtcId, EncoderId, FramebufferId,
        ObjectRef, PlaneId, PropertyInfo, RawConnector, RawCrtc, RawEncoder, RawPlane,
        ResourceIds,
    };
    use crate::layer::BufferInfo;

    fn ms(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    #[test]
    fn first_vblank_is_one_frame_out() {
        assert_eq!(phased_vsync(ms(100), None, ms(16)), ms(116));
    }

    #[test]
    fn vblanks_stay_in_phase() {
        // Last vblank at 100, period 16: vblanks at 116, 132, 148, ...
        assert_eq!(phased_vsync(ms(100), Some(ms(100)), ms(16)), ms(116));
        assert_eq!(phased_vsync(ms(120), Some(ms(100)), ms(16)), ms(132));
        assert_eq!(phased_vsync(ms(132), Some(ms(100)), ms(16)), ms(148));
        assert_eq!(phased_vsync(ms(1000), Some(ms(100)), ms(16)), ms(1012));
    }

    #[test]
    fn clock_behind_last_vblank() {
        assert_eq!(phased_vsync(ms(90), Some(ms(100)), ms(16)), ms(116));
    }

    fn device() -> Arc<dyn KmsDevice> {
        Arc::new(VirtualDevice::new(HardwareDesc::single_display(vec![])))
    }

    fn worker(refresh: Duration) -> (VSyncWorker, mpsc::Receiver<(u32, Duration)>) {
        let (tx, rx) = mpsc::channel();
        let callback: VSyncCallback = Box::new(move |display, ts| {
            let _ = tx.send((display, ts));
        });
        let worker = VSyncWorker::new(device(), 3, 0, refresh, callback).unwrap();
        (worker, rx)
    }

    #[test]
    fn synthetic_vblanks_are_spaced_by_refresh() {
        let (worker, rx) = worker(ms(5));
        assert!(rx.recv_timeout(ms(50)).is_err());

        worker.set_enabled(true);
        let (display, a) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let (_, b) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(display, 3);
        assert!(b > a);
        assert_eq!((b - a).as_nanos() % ms(5).as_nanos(), 0);
        assert!(worker.last_timestamp().unwrap() >= b);
    }

    #[test]
    fn disabling_stops_callbacks() {
        let (worker, rx) = worker(ms(5));
        worker.set_enabled(true);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        worker.set_enabled(false);
        assert!(!worker.is_enabled());
        // At most one vblank already in flight.
        while rx.recv_timeout(ms(100)).is_ok() {}
        assert!(rx.recv_timeout(ms(50)).is_err());
    }

    /// Has vblank events, but the first wait is interrupted by a signal.
    struct InterruptedOnce {
        inner: VirtualDevice,
        waits: AtomicU32,
    }

    impl KmsDevice for InterruptedOnce {
        fn name(&self) -> String {
            self.inner.name()
        }
        fn resources(&self) -> io::Result<ResourceIds> {
            self.inner.resources()
        }
        fn crtc(&self, id: CrtcId) -> io::Result<RawCrtc> {
            self.inner.crtc(id)
        }
        fn encoder(&self, id: EncoderId) -> io::Result<RawEncoder> {
            self.inner.encoder(id)
        }
        fn connector(&self, id: ConnectorId) -> io::Result<RawConnector> {
            self.inner.connector(id)
        }
        fn plane(&self, id: PlaneId) -> io::Result<RawPlane> {
            self.inner.plane(id)
        }
        fn properties(&self, object: ObjectRef) -> io::Result<Vec<(PropertyInfo, u64)>> {
            self.inner.properties(object)
        }
        fn atomic_commit(&self, flags: CommitFlags, req: &AtomicRequest) -> io::Result<()> {
            self.inner.atomic_commit(flags, req)
        }
        fn create_blob(&self, data: &[u8]) -> io::Result<BlobId> {
            self.inner.create_blob(data)
        }
        fn destroy_blob(&self, blob: BlobId) -> io::Result<()> {
            self.inner.destroy_blob(blob)
        }
        fn add_framebuffer(&self, buffer: &BufferInfo) -> io::Result<FramebufferId> {
            self.inner.add_framebuffer(buffer)
        }
        fn remove_framebuffer(&self, fb: FramebufferId) -> io::Result<()> {
            self.inner.remove_framebuffer(fb)
        }

        fn wait_vblank(&self, _pipe: u32) -> io::Result<Duration> {
            let n = self.waits.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                return Err(io::ErrorKind::Interrupted.into());
            }
            thread::sleep(ms(1));
            // Far away from anything the monotonic clock would give.
            Ok(Duration::from_secs(1_000_000) + ms(u64::from(n)))
        }
    }

    #[test]
    fn interrupted_wait_is_retried() {
        let dev = Arc::new(InterruptedOnce {
            inner: VirtualDevice::new(HardwareDesc::single_display(vec![])),
            waits: AtomicU32::new(0),
        });
        let (tx, rx) = mpsc::channel();
        let callback: VSyncCallback = Box::new(move |_, ts| {
            let _ = tx.send(ts);
        });
        let worker = VSyncWorker::new(dev.clone(), 0, 0, ms(16), callback).unwrap();
        worker.set_enabled(true);

        let a = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let b = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(a, Duration::from_secs(1_000_000) + ms(1));
        assert_eq!(b, Duration::from_secs(1_000_000) + ms(2));
        assert!(dev.waits.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn drop_interrupts_long_sleep() {
        let (worker, _rx) = worker(Duration::from_secs(60));
        worker.set_enabled(true);
        thread::sleep(ms(20));

        let start = Instant::now();
        drop(worker);
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
