//! Worker pool for the parallel encode phase.
//!
//! Every pool worker owns one slot, plus one extra slot for the main thread.
//! A slot holds the worker's encoder (started lazily on first use in a frame)
//! and its view space light cache, which survives across frames until
//! flushed.

use std::sync::{Mutex, PoisonError};

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{RenderError, RenderResult};
use crate::renderer::backend::{Encoder, GraphicsBackend};
use crate::renderer::lighting::ViewSpaceLightCache;

#[derive(Debug, Default)]
pub struct WorkerSlot {
    encoder: Option<Encoder>,
    pub cache: ViewSpaceLightCache,
}

impl WorkerSlot {
    /// Encoder of this slot, started on first use.
    pub fn encoder(&mut self, backend: &dyn GraphicsBackend, slot: usize) -> &mut Encoder {
        self.encoder.get_or_insert_with(|| backend.begin_encoder(slot))
    }

    /// Split borrow of the encoder and the light cache.
    pub fn encoder_and_cache(
        &mut self,
        backend: &dyn GraphicsBackend,
        slot: usize,
    ) -> (&mut Encoder, &mut ViewSpaceLightCache) {
        let encoder = self.encoder.get_or_insert_with(|| backend.begin_encoder(slot));
        (encoder, &mut self.cache)
    }

    pub fn is_active(&self) -> bool {
        self.encoder.is_some()
    }
}

pub struct EncoderPool {
    pool: ThreadPool,
    slots: Vec<Mutex<WorkerSlot>>,
}

impl EncoderPool {
    /// One worker per hardware thread.
    pub fn new() -> RenderResult<Self> {
        let workers = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self::with_workers(workers)
    }

    pub fn with_workers(workers: usize) -> RenderResult<Self> {
        let workers = workers.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("render-encode-{}", i))
            .build()
            .map_err(|e| RenderError::Backend(format!("failed to start encode workers: {}", e)))?;
        let slots = (0..=workers).map(|_| Mutex::new(WorkerSlot::default())).collect();
        log::info!("Encoder pool started with {} workers", workers);
        Ok(Self { pool, slots })
    }

    pub fn workers(&self) -> usize {
        self.slots.len() - 1
    }

    /// Slot reserved for draws encoded on the main thread.
    pub fn main_slot(&self) -> usize {
        self.slots.len() - 1
    }

    /// Runs `op` inside the worker pool.
    pub fn install<R, F>(&self, op: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }

    /// Slot of the calling thread. Threads outside the pool get the main slot.
    pub fn current_slot(&self) -> usize {
        match self.pool.current_thread_index() {
            Some(index) if index < self.workers() => index,
            _ => self.main_slot(),
        }
    }

    /// Runs `f` with exclusive access to `slot`. Each worker only ever
    /// touches its own slot, so the lock is never contended.
    pub fn with_slot<R>(&self, slot: usize, f: impl FnOnce(&mut WorkerSlot) -> R) -> R {
        let index = slot.min(self.main_slot());
        let mut guard = self.slots[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Invalidates every view space light cache.
    pub fn flush_caches(&mut self) {
        for slot in &mut self.slots {
            slot.get_mut()
                .unwrap_or_else(PoisonError::into_inner)
                .cache
                .invalidate();
        }
    }

    /// Hands every started encoder back to the backend. Returns how many
    /// encoders were used this frame.
    pub fn finish(&mut self, backend: &dyn GraphicsBackend) -> usize {
        let mut used = 0;
        for slot in &mut self.slots {
            let slot = slot.get_mut().unwrap_or_else(PoisonError::into_inner);
            if let Some(encoder) = slot.encoder.take() {
                backend.end_encoder(encoder);
                used += 1;
            }
        }
        used
    }

    /// Drops every started encoder without handing it to the backend, so
    /// nothing recorded in a failed frame reaches the next one.
    pub fn discard(&mut self) -> usize {
        let mut dropped = 0;
        for slot in &mut self.slots {
            let slot = slot.get_mut().unwrap_or_else(PoisonError::into_inner);
            if slot.encoder.take().is_some() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            log::warn!("Discarded {} encoders of a failed frame", dropped);
        }
        dropped
    }
}

impl std::fmt::Debug for EncoderPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncoderPool")
            .field("workers", &self.workers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::backend::RecordingBackend;
    use rayon::prelude::*;

    #[test]
    fn each_worker_uses_its_own_slot() {
        let mut pool = EncoderPool::with_workers(2).expect("pool");
        let mut backend = RecordingBackend::new();
        pool.install(|| {
            (0..64).into_par_iter().for_each(|_| {
                let slot = pool.current_slot();
                assert!(slot < pool.workers());
                pool.with_slot(slot, |s| {
                    s.encoder(&backend, slot);
                });
            });
        });
        let main = pool.main_slot();
        assert_eq!(pool.current_slot(), main);
        pool.with_slot(main, |s| {
            s.encoder(&backend, main);
        });
        let used = pool.finish(&backend);
        assert!(used >= 2 && used <= 3);
        // a finished pool starts fresh next frame
        assert_eq!(pool.finish(&backend), 0);
        backend.frame().expect("frame");
    }

    #[test]
    fn discarded_encoders_are_not_finished() {
        let mut pool = EncoderPool::with_workers(1).expect("pool");
        let backend = RecordingBackend::new();
        let main = pool.main_slot();
        pool.with_slot(main, |s| {
            s.encoder(&backend, main);
        });
        assert_eq!(pool.discard(), 1);
        assert!(!pool.with_slot(main, |s| s.is_active()));
        assert_eq!(pool.finish(&backend), 0);
    }

    #[test]
    fn zero_workers_still_gets_one() {
        let pool = EncoderPool::with_workers(0).expect("pool");
        assert_eq!(pool.workers(), 1);
        assert_eq!(pool.main_slot(), 1);
    }
}
