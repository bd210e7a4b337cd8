use crate::error::Result;
use candle_core::Tensor;
use std::collections::BTreeMap;

pub type MetricMap = BTreeMap<String, f32>;

/// Accumulates metric maps and averages them per key.
///
/// Keys do not need to be present in every stored map, each key is averaged
/// over the maps that contained it.
#[derive(Debug, Default, Clone)]
pub struct Metrics {
    sums: BTreeMap<String, (f64, usize)>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&mut self, metrics: MetricMap) {
        for (name, value) in metrics {
            let entry = self.sums.entry(name).or_insert((0., 0));
            entry.0 += value as f64;
            entry.1 += 1;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sums.is_empty()
    }

    pub fn average(&self) -> MetricMap {
        self.sums
            .iter()
            .map(|(name, (sum, count))| (name.clone(), (*sum / *count as f64) as f32))
            .collect()
    }
}

/// Records mean, std, min and max of all elements of `values` under `name`.
pub fn log_statistics(metrics: &mut MetricMap, values: &Tensor, name: &str) -> Result<()> {
    let values: Vec<f32> = values.flatten_all()?.to_vec1()?;
    if values.is_empty() {
        return Ok(());
    }
    let count = values.len() as f32;
    let mean = values.iter().sum::<f32>() / count;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / count;
    let min = values.iter().copied().fold(f32::INFINITY, f32::min);
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    metrics.insert(format!("{name}_mean"), mean);
    metrics.insert(format!("{name}_std"), var.sqrt());
    metrics.insert(format!("{name}_min"), min);
    metrics.insert(format!("{name}_max"), max);
    Ok(())
}

/// Adds `{prefix}_{member}` entries and their `{prefix}_mean`.
pub fn log_members(metrics: &mut MetricMap, prefix: &str, per_member: &[f32]) {
    for (member, value) in per_member.iter().enumerate() {
        metrics.insert(format!("{prefix}_{member}"), *value);
    }
    if !per_member.is_empty() {
        let mean = per_member.iter().sum::<f32>() / per_member.len() as f32;
        metrics.insert(format!("{prefix}_mean"), mean);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use candle_core::Device;

    #[test]
    fn average_over_stored_maps() {
        let mut metrics = Metrics::new();
        metrics.store(MetricMap::from([("a".to_string(), 1.), ("b".to_string(), 4.)]));
        metrics.store(MetricMap::from([("a".to_string(), 3.)]));
        let avg = metrics.average();
        assert_eq!(avg["a"], 2.);
        assert_eq!(avg["b"], 4.);
    }

    #[test]
    fn statistics_of_tensor() -> Result<()> {
        let t = Tensor::new(&[[1f32, 3.], [1., 3.]], &Device::Cpu)?;
        let mut metrics = MetricMap::new();
        log_statistics(&mut metrics, &t, "x")?;
        assert_eq!(metrics["x_mean"], 2.);
        assert_eq!(metrics["x_std"], 1.);
        assert_eq!(metrics["x_min"], 1.);
        assert_eq!(metrics["x_max"], 3.);
        Ok(())
    }

    #[test]
    fn member_metrics_have_mean() {
        let mut metrics = MetricMap::new();
        log_members(&mut metrics, "mse/val", &[1., 2., 3.]);
        assert_eq!(metrics["mse/val_1"], 2.);
        assert_eq!(metrics["mse/val_mean"], 2.);
    }
}
