//! Background loader/unloader pair that streams CPU-resident expert
//! weights onto the GPU ring buffer ahead of a layerwise prefill pass.
//!
//! Grounded on `engine/heyi/utils/stream_loader.py` (`StreamLoader._load`,
//! `._unload`, `Event.wait_on/wait_off/set_on/set_off`). The original pairs
//! a `threading.Event` with a `torch.cuda.Event` per switchable operator;
//! here the device half is abstracted behind `DeviceMarker` since real
//! device streams are out of scope. The loader and unloader still run as
//! two cooperating OS threads (not tokio tasks) to match the original's
//! `threading.Thread` pair exactly.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

/// A unit of GPU-resident state that can be switched on (loaded) or off
/// (evicted) — an expert block, a dense layer's weights, etc.
pub trait SwitchOp: Send + Sync {
    fn name(&self) -> &str;
    fn on(&self);
    fn off(&self);
}

/// Stand-in for a device-side synchronization primitive (e.g. a CUDA
/// event). `record`/`synchronize` bracket the host-side wait so that a real
/// backend can still guarantee ordering against its own stream.
pub trait DeviceMarker: Send + Sync {
    fn record(&self);
    fn synchronize(&self);
}

#[derive(Default)]
pub struct NullMarker;
impl DeviceMarker for NullMarker {
    fn record(&self) {}
    fn synchronize(&self) {}
}

struct HostFlag {
    state: Mutex<bool>,
    cv: Condvar,
}

impl HostFlag {
    fn new() -> Self {
        Self { state: Mutex::new(false), cv: Condvar::new() }
    }

    fn set(&self) {
        let mut g = self.state.lock().unwrap();
        *g = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut g = self.state.lock().unwrap();
        while !*g {
            g = self.cv.wait(g).unwrap();
        }
    }

    fn is_set(&self) -> bool {
        *self.state.lock().unwrap()
    }

    fn clear(&self) {
        *self.state.lock().unwrap() = false;
    }
}

/// Pairs a host signal with a device marker for both the "on" (loaded) and
/// "off" (evicted) transitions of a single `SwitchOp`.
pub struct Event<M: DeviceMarker = NullMarker> {
    on: HostFlag,
    off: HostFlag,
    device_on: M,
    device_off: M,
}

impl<M: DeviceMarker> Event<M> {
    pub fn new(device_on: M, device_off: M) -> Self {
        Self { on: HostFlag::new(), off: HostFlag::new(), device_on, device_off }
    }

    pub fn set_on(&self) {
        self.device_on.record();
        self.on.set();
    }

    pub fn wait_on(&self) {
        self.on.wait();
        self.device_on.synchronize();
    }

    pub fn query_on(&self) -> bool {
        self.on.is_set()
    }

    pub fn set_off(&self) {
        self.device_off.record();
        self.off.set();
    }

    pub fn wait_off(&self) {
        self.off.wait();
        self.device_off.synchronize();
    }

    pub fn query_off(&self) -> bool {
        self.off.is_set()
    }

    pub fn reset(&self) {
        self.on.clear();
        self.off.clear();
    }
}

/// Reports free device memory so the loader can decide whether a
/// non-expert op can also be brought resident. Out of scope to implement
/// against a real device here; `runner-backend` implementations supply the
/// real probe.
pub trait DeviceMemoryProbe: Send + Sync {
    fn free_bytes(&self) -> u64;
}

pub struct AlwaysFreeProbe;
impl DeviceMemoryProbe for AlwaysFreeProbe {
    fn free_bytes(&self) -> u64 {
        u64::MAX
    }
}

/// Spawns the loader/unloader thread pair over a fixed op/event list.
/// Grounded 1:1 on `StreamLoader.load`, which starts exactly these two
/// threads and nothing else.
pub struct StreamLoader;

impl StreamLoader {
    pub const FREE_MEM_THRESHOLD_BYTES: u64 = 1_000_000_000;

    pub fn load<O, M, P>(
        ops: Vec<(Arc<O>, Arc<Event<M>>)>,
        probe: Arc<P>,
    ) -> (JoinHandle<()>, JoinHandle<()>)
    where
        O: SwitchOp + 'static,
        M: DeviceMarker + 'static,
        P: DeviceMemoryProbe + 'static,
    {
        let (tx, rx): (Sender<(Arc<O>, Arc<Event<M>>)>, Receiver<(Arc<O>, Arc<Event<M>>)>) = channel();

        let loader = thread::spawn(move || {
            for (op, ev) in ops {
                if ev.query_on() {
                    continue;
                }
                if op.name().contains("experts") || probe.free_bytes() >= Self::FREE_MEM_THRESHOLD_BYTES {
                    op.on();
                    ev.set_on();
                    if tx.send((op, ev)).is_err() {
                        break;
                    }
                }
            }
        });

        let unloader = thread::spawn(move || {
            while let Ok((op, ev)) = rx.recv() {
                ev.wait_off();
                op.off();
            }
        });

        (loader, unloader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingOp {
        name: String,
        on_calls: AtomicUsize,
        off_calls: AtomicUsize,
    }

    impl SwitchOp for CountingOp {
        fn name(&self) -> &str {
            &self.name
        }
        fn on(&self) {
            self.on_calls.fetch_add(1, Ordering::SeqCst);
        }
        fn off(&self) {
            self.off_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn load_then_request_unload_runs_both_hooks() {
        let op = Arc::new(CountingOp {
            name: "layer0.experts.3".to_string(),
            on_calls: AtomicUsize::new(0),
            off_calls: AtomicUsize::new(0),
        });
        let ev = Arc::new(Event::new(NullMarker, NullMarker));
        let (loader, unloader) = StreamLoader::load(vec![(op.clone(), ev.clone())], Arc::new(AlwaysFreeProbe));
        loader.join().unwrap();
        ev.wait_on();
        assert_eq!(op.on_calls.load(Ordering::SeqCst), 1);
        ev.set_off();
        unloader.join().unwrap();
        assert_eq!(op.off_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn already_on_op_is_skipped() {
        let op = Arc::new(CountingOp {
            name: "dense".to_string(),
            on_calls: AtomicUsize::new(0),
            off_calls: AtomicUsize::new(0),
        });
        let ev = Arc::new(Event::new(NullMarker, NullMarker));
        ev.set_on();
        let (loader, unloader) = StreamLoader::load(vec![(op.clone(), ev.clone())], Arc::new(AlwaysFreeProbe));
        loader.join().unwrap();
        assert_eq!(op.on_calls.load(Ordering::SeqCst), 0);
        unloader.join().unwrap(); // nothing queued, sender dropped, recv errors out
    }
}
