use crate::error::Result;
use candle_core::Tensor;

/// Write-only sink for scalar and histogram records. Nothing in the engine
/// reads these back.
pub trait Logger {
    fn log_scalar(&mut self, name: &str, value: f32, step: usize);

    fn log_histogram(&mut self, name: &str, values: &Tensor, step: usize) -> Result<()>;
}

/// Emits every record as a `tracing` event on the `pets::logger` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log_scalar(&mut self, name: &str, value: f32, step: usize) {
        tracing::info!(target: "pets::logger", name, value, step, "scalar");
    }

    fn log_histogram(&mut self, name: &str, values: &Tensor, step: usize) -> Result<()> {
        let values = values.flatten_all()?;
        let min = values.min(0)?.to_scalar::<f32>()?;
        let max = values.max(0)?.to_scalar::<f32>()?;
        let mean = values.mean_all()?.to_scalar::<f32>()?;
        tracing::info!(target: "pets::logger", name, min, mean, max, step, "histogram");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use candle_core::Device;

    #[test]
    fn histogram_of_any_rank() -> Result<()> {
        let mut logger = TracingLogger;
        let weights = Tensor::new(&[[[1f32, -2.], [0.5, 4.]]], &Device::Cpu)?;
        logger.log_histogram("layer0/weight", &weights, 10)?;
        logger.log_scalar("xentropy/val_mean", 0.5, 10);
        Ok(())
    }
}
