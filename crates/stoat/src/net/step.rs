use std::fmt::Write as _;

use log::info;

use stoat_core::{Buffer, Error, Result};
use stoat_nn::LayerKind;

use super::{Net, StepPhase};

// Whole-step conveniences on top of the phase-by-phase interface.

impl Net {
    /// One complete training step: forward, loss, backward, gradient
    /// sync, update. Returns the batch's average loss across outputs.
    pub fn train_batch(&mut self, x: &[Buffer], y: &[Buffer]) -> Result<f32> {
        self.forward(x)?;
        let totals = self.compute_loss(y)?;
        self.backward(y)?;
        self.sync_grads()?;
        self.update()?;
        Ok(totals.iter().sum::<f32>() / self.batch as f32)
    }

    /// Train over the full dataset for `epochs` epochs, slicing
    /// `batch_size` rows at a time (the last batch of an epoch may be
    /// smaller). Loss totals reset at each epoch boundary.
    pub fn fit(
        &mut self,
        x: &[Buffer],
        y: &[Buffer],
        batch_size: usize,
        epochs: usize,
    ) -> Result<()> {
        self.check_built()?;
        if batch_size == 0 {
            return Err(Error::msg("batch size must be at least 1"));
        }
        let samples = dataset_rows(x, y)?;
        for epoch in 1..=epochs {
            self.reset_loss();
            let mut offset = 0;
            while offset < samples {
                let rows = batch_size.min(samples - offset);
                let bx = slice_all(x, offset, rows)?;
                let by = slice_all(y, offset, rows)?;
                self.train_batch(&bx, &by)?;
                offset += rows;
            }
            info!(
                "epoch {}/{}: avg loss {:?}",
                epoch,
                epochs,
                self.get_loss_values()
            );
        }
        Ok(())
    }

    /// Evaluate losses and metrics over the dataset in one pass, without
    /// touching gradients or parameters. Returns per-output average
    /// losses and metrics; the running totals pick them up as well.
    pub fn evaluate(&mut self, x: &[Buffer], y: &[Buffer]) -> Result<(Vec<f32>, Vec<f32>)> {
        self.check_built()?;
        let samples = dataset_rows(x, y)?;
        self.forward(x)?;
        let loss_totals =
            self.apply_targets(y, |net, o, target, output| net.losses[o].value(target, output))?;
        let metric_totals = self.apply_targets(y, |net, o, target, output| {
            net.metrics[o].value(target, output)
        })?;
        // No gradient state was touched; the step is abandoned cleanly.
        self.phase = StepPhase::Idle;

        for (o, v) in loss_totals.iter().enumerate() {
            self.loss_totals[o] += f64::from(*v);
        }
        for (o, v) in metric_totals.iter().enumerate() {
            self.metric_totals[o] += f64::from(*v);
        }
        self.seen_samples += samples;

        let n = samples as f32;
        Ok((
            loss_totals.iter().map(|v| v / n).collect(),
            metric_totals.iter().map(|v| v / n).collect(),
        ))
    }

    /// Human-readable layer table with parameter counts.
    pub fn summary(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(
            s,
            "{:<12} {:<8} {:<16} {:>10}",
            "layer", "kind", "output", "params"
        );
        let mut total = 0usize;
        for node in self.graph().nodes() {
            let params = match &node.kind {
                LayerKind::Affine(st) => st.w.len() + st.b.len(),
                _ => 0,
            };
            total += params;
            let _ = writeln!(
                s,
                "{:<12} {:<8} {:<16} {:>10}",
                node.name,
                node.kind.kind_name(),
                format!("{}", node.output.shape()),
                params
            );
        }
        let _ = writeln!(s, "total trainable parameters: {}", total);
        let _ = write!(s, "replicas: {}", self.replica_count().max(1));
        s
    }
}

fn dataset_rows(x: &[Buffer], y: &[Buffer]) -> Result<usize> {
    let first = x
        .first()
        .ok_or_else(|| Error::msg("dataset needs at least one input buffer"))?;
    let samples = first
        .dims()
        .first()
        .copied()
        .ok_or_else(|| Error::msg("dataset buffers need a leading batch dimension"))?;
    for b in x.iter().chain(y) {
        if b.dims().first().copied() != Some(samples) {
            return Err(Error::msg(
                "dataset buffers disagree on the sample dimension",
            ));
        }
    }
    Ok(samples)
}

fn slice_all(buffers: &[Buffer], offset: usize, rows: usize) -> Result<Vec<Buffer>> {
    buffers
        .iter()
        .map(|b| Net::slice_rows(b, offset, rows))
        .collect()
}
