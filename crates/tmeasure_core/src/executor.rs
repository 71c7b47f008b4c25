//! Per-layer parallel aggregation.
//!
//! One producer (the calling thread) drives a single traversal of an
//! [`ActivationsIterator`]. Every layer gets its own worker thread owning one
//! [`LayerMeasure`]. Each worker is fed through two bounded channels:
//!
//! - a marker channel carrying one [`GroupMarker`] per group,
//! - a tensor channel carrying that group's [`LayerBatch`]es, closed off by
//!   a `None` sentinel.
//!
//! Dropping the senders ends the stream. Both channels are bounded, so a
//! slow layer applies back-pressure to the producer instead of buffering.
//! Any worker error or panic aborts the evaluation and no partial result is
//! returned.

use crate::config::{ActivationsOrder, ExecutorConfig};
use crate::error::{MeasureError, Result};
use crate::iterator::{ActivationGroup, ActivationsIterator, LayerBatch};
use crate::measure::MeasureResult;
use crate::model::{ImageDataset, ObservableModel};
use ndarray::{ArrayD, IxDyn};
use std::collections::BTreeMap;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread;
use tracing::{debug, info, warn};

/// Start of a group: a sample index (samples-first) or a transformation
/// index (transformations-first).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupMarker {
    pub index: usize,
}

/// Final values of one layer measure.
#[derive(Debug, Clone, Default)]
pub struct LayerOutput {
    pub values: ArrayD<f64>,
    /// Named secondary arrays, e.g. fitted thresholds.
    pub extras: BTreeMap<String, ArrayD<f64>>,
}

impl LayerOutput {
    pub fn new(values: ArrayD<f64>) -> Self {
        Self {
            values,
            extras: BTreeMap::new(),
        }
    }

    pub fn with_extra(mut self, name: impl Into<String>, values: ArrayD<f64>) -> Self {
        self.extras.insert(name.into(), values);
        self
    }
}

/// Accumulator owned by one layer worker.
pub trait LayerMeasure: Send {
    fn begin_group(&mut self, _marker: GroupMarker) -> Result<()> {
        Ok(())
    }

    fn update(&mut self, batch: LayerBatch) -> Result<()>;

    fn end_group(&mut self) -> Result<()> {
        Ok(())
    }

    fn finish(self) -> Result<LayerOutput>;
}

/// A measure computed independently per layer on one traversal order.
pub trait PerLayerMeasure {
    type Layer: LayerMeasure;

    fn id(&self) -> String;

    fn order(&self) -> ActivationsOrder;

    /// Fresh accumulator for layer `index` of the iterator.
    fn layer_measure(&self, index: usize, name: &str) -> Result<Self::Layer>;
}

/// What one worker produced.
#[derive(Debug, Clone)]
pub struct LayerOutcome {
    pub name: String,
    pub values: ArrayD<f64>,
    pub extras: BTreeMap<String, ArrayD<f64>>,
    /// Activation rows consumed.
    pub observations: u64,
    pub groups: u64,
}

struct WorkerReport {
    output: LayerOutput,
    observations: u64,
    groups: u64,
}

struct WorkerChannels {
    markers: SyncSender<GroupMarker>,
    tensors: SyncSender<Option<LayerBatch>>,
}

#[derive(Debug, Clone, Default)]
pub struct PerLayerMeasureExecutor {
    config: ExecutorConfig,
}

impl PerLayerMeasureExecutor {
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run `measure` over one traversal and collect the per-layer outcomes
    /// in the iterator's layer order.
    pub fn run<M, D, P>(
        &self,
        iterator: &ActivationsIterator<'_, M, D>,
        measure: &P,
    ) -> Result<Vec<LayerOutcome>>
    where
        M: ObservableModel + ?Sized,
        D: ImageDataset + ?Sized,
        P: PerLayerMeasure,
    {
        let names = iterator.layer_names().to_vec();
        let order = measure.order();
        if iterator.dataset().is_empty() {
            return Err(MeasureError::EmptyDataset);
        }
        if iterator.observation_count(order) == 0 {
            return Err(MeasureError::config(
                "batch_size",
                format!(
                    "batch size {} exceeds the {} dataset samples, {} traversal yields no batches",
                    iterator.config().batch_size,
                    iterator.dataset().len(),
                    order
                ),
            ));
        }
        let layers = names
            .iter()
            .enumerate()
            .map(|(i, name)| measure.layer_measure(i, name))
            .collect::<Result<Vec<_>>>()?;

        info!(
            measure = %measure.id(),
            order = %order,
            layers = names.len(),
            expected_observations = iterator.observation_count(order),
            "evaluating per-layer measure"
        );

        let capacity = self.config.channel_capacity;
        let (produced, joined) = thread::scope(|scope| {
            let mut channels = Vec::with_capacity(layers.len());
            let mut handles = Vec::with_capacity(layers.len());
            for layer in layers {
                let (marker_tx, marker_rx) = sync_channel(capacity);
                let (tensor_tx, tensor_rx) = sync_channel(capacity);
                channels.push(WorkerChannels {
                    markers: marker_tx,
                    tensors: tensor_tx,
                });
                handles.push(scope.spawn(move || run_worker(layer, marker_rx, tensor_rx)));
            }

            let produced = match order {
                ActivationsOrder::SamplesFirst => produce(iterator.samples_first(), &channels),
                ActivationsOrder::TransformationsFirst => {
                    produce(iterator.transformations_first(), &channels)
                }
            };
            // closing every channel lets the workers drain and finish
            drop(channels);

            let joined: Vec<thread::Result<Result<WorkerReport>>> =
                handles.into_iter().map(|h| h.join()).collect();
            (produced, joined)
        });

        let mut reports = Vec::with_capacity(names.len());
        let mut worker_error = None;
        let mut disconnect = None;
        for (name, joined) in names.iter().zip(joined) {
            match joined {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(e)) if e.is_disconnect() => {
                    disconnect.get_or_insert(MeasureError::WorkerFailed {
                        layer: name.clone(),
                        source: Box::new(e),
                    });
                }
                Ok(Err(e)) => {
                    warn!(layer = %name, error = %e, "layer worker failed");
                    worker_error.get_or_insert(MeasureError::WorkerFailed {
                        layer: name.clone(),
                        source: Box::new(e),
                    });
                }
                Err(_) => {
                    warn!(layer = %name, "layer worker panicked");
                    worker_error.get_or_insert(MeasureError::WorkerPanicked(name.clone()));
                }
            }
        }

        // A failed worker closes its channels, so the producer only sees a
        // disconnect; report the worker's own error instead.
        if let Some(e) = worker_error {
            return Err(e);
        }
        produced?;
        if let Some(e) = disconnect {
            return Err(e);
        }

        let outcomes: Vec<LayerOutcome> = names
            .into_iter()
            .zip(reports)
            .map(|(name, report)| {
                debug!(
                    layer = %name,
                    observations = report.observations,
                    groups = report.groups,
                    "layer worker finished"
                );
                LayerOutcome {
                    name,
                    values: report.output.values,
                    extras: report.output.extras,
                    observations: report.observations,
                    groups: report.groups,
                }
            })
            .collect();
        info!(measure = %measure.id(), "per-layer measure complete");
        Ok(outcomes)
    }

    /// [`Self::run`], packaged as a [`MeasureResult`]. Layer extras become
    /// auxiliary results named after the extra.
    pub fn evaluate<M, D, P>(
        &self,
        iterator: &ActivationsIterator<'_, M, D>,
        measure: &P,
    ) -> Result<MeasureResult>
    where
        M: ObservableModel + ?Sized,
        D: ImageDataset + ?Sized,
        P: PerLayerMeasure,
    {
        let outcomes = self.run(iterator, measure)?;
        into_result(measure.id(), outcomes)
    }
}

fn into_result(id: String, outcomes: Vec<LayerOutcome>) -> Result<MeasureResult> {
    let names: Vec<String> = outcomes.iter().map(|o| o.name.clone()).collect();
    let extra_names: Vec<String> = {
        let mut keys: Vec<String> = outcomes
            .iter()
            .flat_map(|o| o.extras.keys().cloned())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    };

    let mut auxiliary = BTreeMap::new();
    for extra in extra_names {
        let layers = outcomes
            .iter()
            .map(|o| {
                o.extras
                    .get(&extra)
                    .cloned()
                    .unwrap_or_else(|| ArrayD::zeros(IxDyn(&[0])))
            })
            .collect();
        let result = MeasureResult::new(layers, names.clone(), format!("{}.{}", id, extra))?;
        auxiliary.insert(extra, result);
    }

    let layers = outcomes.into_iter().map(|o| o.values).collect();
    let mut result = MeasureResult::new(layers, names, id)?;
    for (name, aux) in auxiliary {
        result = result.with_auxiliary(name, aux);
    }
    Ok(result)
}

fn produce<I, G>(groups: I, channels: &[WorkerChannels]) -> Result<()>
where
    I: Iterator<Item = Result<G>>,
    G: ActivationGroup,
{
    for group in groups {
        let group = group?;
        let marker = GroupMarker {
            index: group.index(),
        };
        for ch in channels {
            ch.markers.send(marker).map_err(|_| closed(marker))?;
        }
        for batch in group.into_batches() {
            let layers = batch?.into_layers();
            if layers.len() != channels.len() {
                return Err(MeasureError::shape_mismatch(
                    "layers per batch",
                    &[channels.len()],
                    &[layers.len()],
                ));
            }
            for (ch, layer) in channels.iter().zip(layers) {
                ch.tensors.send(Some(layer)).map_err(|_| closed(marker))?;
            }
        }
        for ch in channels {
            ch.tensors.send(None).map_err(|_| closed(marker))?;
        }
    }
    Ok(())
}

fn closed(marker: GroupMarker) -> MeasureError {
    MeasureError::StreamInterrupted(format!(
        "layer worker hung up during group {}",
        marker.index
    ))
}

fn run_worker<L: LayerMeasure>(
    mut layer: L,
    markers: Receiver<GroupMarker>,
    tensors: Receiver<Option<LayerBatch>>,
) -> Result<WorkerReport> {
    let mut observations = 0u64;
    let mut groups = 0u64;
    while let Ok(marker) = markers.recv() {
        layer.begin_group(marker)?;
        loop {
            match tensors.recv() {
                Ok(Some(batch)) => {
                    observations += batch.rows() as u64;
                    layer.update(batch)?;
                }
                Ok(None) => break,
                Err(_) => {
                    return Err(MeasureError::StreamInterrupted(format!(
                        "tensor channel closed inside group {}",
                        marker.index
                    )))
                }
            }
        }
        layer.end_group()?;
        groups += 1;
    }
    Ok(WorkerReport {
        output: layer.finish()?,
        observations,
        groups,
    })
}
