use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::thread;
use std::time::{Duration, Instant};

/// Coarse batch progress for extraction and validation: shared counters plus
/// a background ticker that prints a status line every few seconds while
/// workers run. Disabled instances are free.
#[derive(Clone)]
pub struct Progress {
    enabled: bool,
    stage: Arc<Mutex<String>>,
    files_done: Arc<AtomicU64>,
    files_total: Arc<AtomicU64>,
    bytes_done: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
}

impl Progress {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            stage: Arc::new(Mutex::new(String::new())),
            files_done: Arc::new(AtomicU64::new(0)),
            files_total: Arc::new(AtomicU64::new(0)),
            bytes_done: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_stage(&self, s: &str) {
        if self.enabled {
            *self.stage.lock().unwrap() = s.to_string();
        }
    }

    pub fn set_files_total(&self, n: u64) {
        self.files_total.store(n, Ordering::Relaxed);
    }

    pub fn inc_file(&self) {
        self.files_done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes_done.fetch_add(n, Ordering::Relaxed);
    }

    pub fn start(&self) {
        if !self.enabled {
            return;
        }
        self.running.store(true, Ordering::Relaxed);
        let stage = self.stage.clone();
        let files_done = self.files_done.clone();
        let files_total = self.files_total.clone();
        let bytes_done = self.bytes_done.clone();
        let running = self.running.clone();
        thread::spawn(move || {
            let t0 = Instant::now();
            while running.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_secs(2));
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                let s = stage.lock().unwrap().clone();
                let fd = files_done.load(Ordering::Relaxed);
                let ft = files_total.load(Ordering::Relaxed);
                let mb = bytes_done.load(Ordering::Relaxed) as f64 / (1 << 20) as f64;
                eprintln!("[{:>4}s] {} | files {}/{} | {:.1} MiB", t0.elapsed().as_secs(), s, fd, ft, mb);
            }
        });
    }

    pub fn stop(&self) {
        if self.enabled {
            self.running.store(false, Ordering::Relaxed);
        }
    }
}
