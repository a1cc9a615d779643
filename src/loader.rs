//! Batched, prefetching iteration over a [`PairedDataset`].
//!
//! A pass splits the (optionally shuffled) index order into batches and hands batch `k` to
//! worker `k % num_workers`. Every worker owns a seeded RNG and a bounded channel of
//! `prefetch_factor` batches; the consumer reads the channels round-robin, so batches arrive in
//! order and no index is produced twice or skipped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tch::{Device, Tensor};
use tracing::{debug, warn};

use crate::dataset::PairedDataset;
use crate::error::{DataError, DataResult};

const GOLDEN: u64 = 0x9E37_79B9_7F4A_7C15;

fn mix(seed: u64, epoch: u64, stream: u64) -> u64 {
    seed ^ epoch.wrapping_add(1).wrapping_mul(GOLDEN) ^ stream.wrapping_mul(GOLDEN).rotate_left(29)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderConfig {
    pub batch_size: usize,
    /// 0 loads batches on the consuming thread.
    pub num_workers: usize,
    pub prefetch_factor: usize,
    pub shuffle: bool,
    pub pin_memory: bool,
    pub seed: u64,
}

/// A collated batch. Samples that failed are left out of the tensors and listed in `failures`.
#[derive(Debug)]
pub struct PairBatch {
    pub source: Tensor,
    pub target: Tensor,
    pub indices: Vec<usize>,
    pub failures: Vec<DataError>,
}

impl PairBatch {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

#[derive(Debug)]
pub struct DataLoader {
    dataset: Arc<PairedDataset>,
    cfg: LoaderConfig,
    epoch: AtomicU64,
}

impl DataLoader {
    pub fn new(dataset: Arc<PairedDataset>, cfg: LoaderConfig) -> Self {
        Self {
            dataset,
            cfg: LoaderConfig {
                batch_size: cfg.batch_size.max(1),
                prefetch_factor: cfg.prefetch_factor.max(1),
                ..cfg
            },
            epoch: AtomicU64::new(0),
        }
    }

    pub fn dataset(&self) -> &PairedDataset {
        &self.dataset
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.cfg
    }

    /// Number of batches in one pass.
    pub fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.cfg.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// Dataset indices in the order they are visited during `epoch`.
    pub fn order(&self, epoch: u64) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.cfg.shuffle {
            let mut rng = StdRng::seed_from_u64(mix(self.cfg.seed, epoch, 0));
            order.shuffle(&mut rng);
        }
        order
    }

    /// Start the next pass. Each call advances the epoch, so a shuffling loader visits a new
    /// order every time.
    pub fn iter(&self) -> BatchIter {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst);
        self.iter_epoch(epoch)
    }

    pub fn iter_epoch(&self, epoch: u64) -> BatchIter {
        let batches: Vec<Vec<usize>> = self
            .order(epoch)
            .chunks(self.cfg.batch_size)
            .map(<[usize]>::to_vec)
            .collect();
        let total = batches.len();
        let pin = self.cfg.pin_memory && tch::Cuda::is_available();
        debug!(epoch, batches = total, workers = self.cfg.num_workers, "starting pass");

        if self.cfg.num_workers == 0 {
            return BatchIter {
                inner: Inner::Inline {
                    dataset: self.dataset.clone(),
                    batches,
                    rng: StdRng::seed_from_u64(mix(self.cfg.seed, epoch, 1)),
                    pin,
                },
                next: 0,
                total,
            };
        }

        let workers = self.cfg.num_workers.min(total.max(1));
        let mut receivers = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let (tx, rx) = bounded(self.cfg.prefetch_factor);
            let assigned: Vec<(usize, Vec<usize>)> = batches
                .iter()
                .enumerate()
                .skip(worker)
                .step_by(workers)
                .map(|(k, b)| (k, b.clone()))
                .collect();
            let dataset = self.dataset.clone();
            let seed = mix(self.cfg.seed, epoch, worker as u64 + 1);
            handles.push(thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                for (k, indices) in assigned {
                    let batch = collate(&dataset, k, &indices, pin, &mut rng);
                    if tx.send(batch).is_err() {
                        debug!(worker, batch = k, "consumer gone; worker stopping");
                        break;
                    }
                }
            }));
            receivers.push(rx);
        }
        BatchIter {
            inner: Inner::Workers { receivers, handles },
            next: 0,
            total,
        }
    }
}

fn collate<R: Rng + ?Sized>(
    dataset: &PairedDataset,
    batch: usize,
    indices: &[usize],
    pin: bool,
    rng: &mut R,
) -> DataResult<PairBatch> {
    let mut sources = Vec::with_capacity(indices.len());
    let mut targets = Vec::with_capacity(indices.len());
    let mut ok = Vec::with_capacity(indices.len());
    let mut failures = Vec::new();
    for &index in indices {
        match dataset.get(index, rng) {
            Ok((s, t)) => {
                sources.push(s);
                targets.push(t);
                ok.push(index);
            }
            Err(e) => {
                warn!(batch, error = %e, "dropping sample from batch");
                failures.push(e);
            }
        }
    }
    if ok.is_empty() {
        let first = failures
            .first()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "empty batch".to_string());
        return Err(DataError::Collate {
            batch,
            msg: format!("all {} samples failed; first: {first}", indices.len()),
        });
    }
    let stack = |xs: &[Tensor]| -> DataResult<Tensor> {
        let stacked = Tensor::f_stack(xs, 0).map_err(|e| DataError::Collate {
            batch,
            msg: e.to_string(),
        })?;
        if pin {
            stacked
                .f_pin_memory(Device::Cuda(0))
                .map_err(|e| DataError::Collate {
                    batch,
                    msg: format!("pinning failed: {e}"),
                })
        } else {
            Ok(stacked)
        }
    };
    Ok(PairBatch {
        source: stack(&sources)?,
        target: stack(&targets)?,
        indices: ok,
        failures,
    })
}

enum Inner {
    Inline {
        dataset: Arc<PairedDataset>,
        batches: Vec<Vec<usize>>,
        rng: StdRng,
        pin: bool,
    },
    Workers {
        receivers: Vec<Receiver<DataResult<PairBatch>>>,
        handles: Vec<JoinHandle<()>>,
    },
}

/// One pass over a loader. Dropping it stops the workers after their in-flight batch.
pub struct BatchIter {
    inner: Inner,
    next: usize,
    total: usize,
}

impl BatchIter {
    pub fn total(&self) -> usize {
        self.total
    }
}

impl Iterator for BatchIter {
    type Item = DataResult<PairBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total {
            return None;
        }
        let k = self.next;
        self.next += 1;
        let item = match &mut self.inner {
            Inner::Inline {
                dataset,
                batches,
                rng,
                pin,
            } => collate(dataset, k, &batches[k], *pin, rng),
            Inner::Workers { receivers, .. } => {
                let rx = &receivers[k % receivers.len()];
                rx.recv().unwrap_or_else(|_| {
                    Err(DataError::Collate {
                        batch: k,
                        msg: "loader worker exited early".to_string(),
                    })
                })
            }
        };
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.total - self.next;
        (left, Some(left))
    }
}

impl ExactSizeIterator for BatchIter {}

impl Drop for BatchIter {
    fn drop(&mut self) {
        if let Inner::Workers { receivers, handles } = &mut self.inner {
            receivers.clear();
            for handle in handles.drain(..) {
                if handle.join().is_err() {
                    warn!("loader worker panicked");
                }
            }
        }
    }
}
