use std::path::Path;

/// Metrics/visualization sink injected into the training loop.
///
/// Implementations must never mutate training state; they only observe.
pub trait TelemetrySink {
    fn log_scalars(&mut self, step: usize, scalars: &[(&str, f64)]);

    fn log_image(&mut self, _step: usize, _path: &Path) {}
}

/// Default sink printing one progress line per logged step.
pub struct StdoutSink;

impl TelemetrySink for StdoutSink {
    fn log_scalars(&mut self, step: usize, scalars: &[(&str, f64)]) {
        let formatted: Vec<String> = scalars
            .iter()
            .map(|(name, value)| format!("{name}: {value:.5}"))
            .collect();
        println!("step {step} | {}", formatted.join(", "));
    }

    fn log_image(&mut self, step: usize, path: &Path) {
        println!("step {step} | samples -> {}", path.display());
    }
}

/// Sink that drops everything; used in tests.
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn log_scalars(&mut self, _step: usize, _scalars: &[(&str, f64)]) {}
}
