use crate::error::{ExchangeError, SetupError};
use crate::exchange::Exchange;
use crate::image::SharedImage;
use crate::layout::Side;
use crate::region::Region;
use crate::scheduler::{wait_rest_of_period, PeriodState};
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Default)]
struct Counters {
    cycles: CachePadded<AtomicU64>,
    consumed: CachePadded<AtomicU64>,
}

/// The device side of the exchange, run on its own thread.
///
/// Every device cycle it claims new output data (if any) and publishes a
/// fresh input buffer computed by `transform` from the latest output it
/// holds, following the same lock and swap discipline as the control task.
/// Stands in for the backplane driver in tests and in `simulate` mode.
#[derive(Debug)]
pub struct SimulatedDevice {
    stop: Arc<AtomicBool>,
    counters: Arc<Counters>,
    handle: Option<JoinHandle<()>>,
}

/// Why a simulated device could not start.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error("failed to spawn device thread: {0}")]
    Thread(#[from] std::io::Error),
}

impl SimulatedDevice {
    pub fn spawn<R, F>(
        image: Arc<SharedImage<R>>,
        period: Duration,
        mut transform: F,
    ) -> Result<Self, SpawnError>
    where
        R: Region + 'static,
        F: FnMut(&[u8], &mut [u8]) + Send + 'static,
    {
        let mut io = Exchange::new(image, Side::Device)?;
        let mut state = PeriodState::arm(period)?;
        let stop = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(Counters::default());

        let handle = {
            let stop = stop.clone();
            let counters = counters.clone();
            std::thread::Builder::new()
                .name("simulated-device".into())
                .spawn(move || {
                    let (tx, rx) = io.split();
                    while !stop.load(Ordering::Relaxed) {
                        let step = rx
                            .try_consume()
                            .map(|new| new.is_some())
                            .and_then(|consumed| {
                                if consumed {
                                    counters.consumed.fetch_add(1, Ordering::Relaxed);
                                }
                                let output = rx.current()?;
                                tx.publish_with(|input| transform(output, input))
                            });
                        if let Err(e) = step {
                            log::error!("simulated device giving up: {}", e);
                            break;
                        }
                        counters.cycles.fetch_add(1, Ordering::Relaxed);
                        state = wait_rest_of_period(state);
                    }
                    log::debug!(
                        "simulated device stopped after {} cycles",
                        counters.cycles.load(Ordering::Relaxed)
                    );
                })?
        };

        Ok(Self {
            stop,
            counters,
            handle: Some(handle),
        })
    }

    /// A device that mirrors every output byte back as input.
    pub fn echo<R: Region + 'static>(
        image: Arc<SharedImage<R>>,
        period: Duration,
    ) -> Result<Self, SpawnError> {
        Self::spawn(image, period, |output, input| {
            let n = output.len().min(input.len());
            input[..n].copy_from_slice(&output[..n]);
        })
    }

    /// Device cycles completed so far.
    pub fn cycles(&self) -> u64 {
        self.counters.cycles.load(Ordering::Relaxed)
    }

    /// Output buffers claimed so far.
    pub fn consumed(&self) -> u64 {
        self.counters.consumed.load(Ordering::Relaxed)
    }

    /// Stops the device thread after its current cycle and waits for it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("simulated device thread panicked");
            }
        }
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}
