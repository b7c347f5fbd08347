use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard};

use ndarray_rand::rand::{Rng, seq::SliceRandom};
use tracing::{debug, info};

use crate::config::TrainingConfig;
use crate::error::{Error, Result};
use crate::grid::{EditRequest, KernelGrid};
use crate::mnist::Sample;
use crate::network::Network;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrainingState {
    Idle = 0,
    Training = 1,
    /// A stop was requested; the loop exits once the current epoch is done.
    Stopping = 2,
}

impl TrainingState {
    fn from_u8(value: u8) -> TrainingState {
        match value {
            1 => TrainingState::Training,
            2 => TrainingState::Stopping,
            _ => TrainingState::Idle,
        }
    }
}

/// Shared run/stop switch between the training loop and whoever drives it.
#[derive(Debug)]
pub struct TrainingControl {
    state: AtomicU8,
}

impl Default for TrainingControl {
    fn default() -> Self {
        TrainingControl {
            state: AtomicU8::new(TrainingState::Idle as u8),
        }
    }
}

impl TrainingControl {
    pub fn state(&self) -> TrainingState {
        TrainingState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Idle -> Training. Anything else means a run is still in flight.
    pub fn start(&self) -> Result<()> {
        self.transition(TrainingState::Idle, TrainingState::Training)
            .map_err(|_| Error::AlreadyTraining)
    }

    /// Training -> Stopping. Returns whether a running loop was asked to stop.
    pub fn request_stop(&self) -> bool {
        let stopped = self
            .transition(TrainingState::Training, TrainingState::Stopping)
            .is_ok();
        if stopped {
            info!("stop requested; finishing the current epoch");
        }
        stopped
    }

    fn finish(&self) {
        self.state
            .store(TrainingState::Idle as u8, Ordering::Release);
    }

    fn transition(
        &self,
        from: TrainingState,
        to: TrainingState,
    ) -> std::result::Result<(), TrainingState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| debug!(?from, ?to, "training state changed"))
            .map_err(TrainingState::from_u8)
    }
}

// Puts the control back to Idle however the loop exits.
struct FinishOnDrop<'a>(&'a TrainingControl);

impl Drop for FinishOnDrop<'_> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// Summary handed to the tick callback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    pub epoch: u32,
    pub loss: f32,
    pub correct: usize,
    pub total: usize,
}

/// Owns the network and serialises every write to it. Gradient steps and user edits each take
/// the lock, so an edit always lands between two mini-batches and never inside one.
#[derive(Debug)]
pub struct Workbench {
    network: Mutex<Network>,
    control: TrainingControl,
}

impl Workbench {
    pub fn new(network: Network) -> Workbench {
        Workbench {
            network: Mutex::new(network),
            control: TrainingControl::default(),
        }
    }

    pub fn control(&self) -> &TrainingControl {
        &self.control
    }

    fn lock(&self) -> Result<MutexGuard<'_, Network>> {
        self.network.lock().map_err(|_| Error::Poisoned)
    }

    pub fn warm<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<()> {
        self.lock()?.warm(rng)?;
        Ok(())
    }

    pub fn extract_grid(&self) -> Result<KernelGrid> {
        KernelGrid::extract(&*self.lock()?)
    }

    /// Run `f` with exclusive access to the network.
    pub fn with_network<T>(&self, f: impl FnOnce(&mut Network) -> T) -> Result<T> {
        Ok(f(&mut *self.lock()?))
    }

    pub fn into_network(self) -> Result<Network> {
        self.network.into_inner().map_err(|_| Error::Poisoned)
    }

    /// Apply one user edit: extract a fresh grid, swap in the edited tile, write the grid back.
    /// All three steps happen under one lock, so the grid can never be stale.
    pub fn apply_edit(&self, request: &EditRequest) -> Result<()> {
        let mut network = self.lock()?;
        let mut grid = KernelGrid::extract(&network)?;
        grid.ingest_edit(request)?;
        grid.write_back(&mut network)?;
        info!(kernel = %request.id, version = network.version(), "applied kernel edit");
        Ok(())
    }

    /// Mini-batch gradient descent over `training_data`, reporting accuracy on `test_data` after
    /// every epoch. Every `render_every` epochs a freshly extracted grid is handed to `on_tick`.
    /// Returns the number of epochs completed; the loop ends early, after finishing the current
    /// epoch, once a stop has been requested.
    pub fn train<R, F>(
        &self,
        training_data: &mut [Sample],
        test_data: &[Sample],
        config: &TrainingConfig,
        rng: &mut R,
        mut on_tick: F,
    ) -> Result<u32>
    where
        R: Rng + ?Sized,
        F: FnMut(&Tick, &KernelGrid),
    {
        self.control.start()?;
        let _finish = FinishOnDrop(&self.control);
        info!(
            epochs = config.epochs,
            batch_size = config.batch_size,
            learning_rate = config.learning_rate,
            "training started"
        );

        let batch_size = config.batch_size.max(1);
        let mut completed = 0;
        for epoch in 0..config.epochs {
            if config.shuffle {
                training_data.shuffle(rng);
            }

            let mut loss = 0.0;
            let mut batches = 0;
            for mini_batch in training_data.chunks(batch_size) {
                loss += self
                    .lock()?
                    .train_batch(mini_batch, config.learning_rate)?;
                batches += 1;
            }
            completed = epoch + 1;

            let tick = Tick {
                epoch,
                loss: if batches > 0 { loss / batches as f32 } else { 0.0 },
                correct: self.lock()?.evaluate(test_data)?,
                total: test_data.len(),
            };
            info!(
                "Epoch {epoch}: {} / {} (loss {:.4})",
                tick.correct, tick.total, tick.loss
            );

            if config.render_every > 0 && completed % config.render_every == 0 {
                let grid = self.extract_grid()?;
                on_tick(&tick, &grid);
            }

            if self.control.state() == TrainingState::Stopping {
                break;
            }
        }

        info!(epochs = completed, "training finished");
        Ok(completed)
    }
}
