//! Multi-sample enrollment.

use crate::engine::{EngineError, EngineShared};
use presence_core::Subject;
use std::sync::Arc;

/// Outcome of a successful enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrollReport {
    pub requested: usize,
    /// Samples that stored at least one descriptor.
    pub captured: usize,
    /// Descriptors written, across all samples.
    pub stored: usize,
}

fn progress(done: usize, total: usize) -> u8 {
    ((done as f64 / total as f64) * 100.0).round().clamp(0.0, 100.0) as u8
}

/// Capture `sample_count` samples spaced by the configured delay.
///
/// Missing frames, frames without faces and provider failures only cost
/// that sample. Storage failures abort the run.
pub(crate) async fn run<F>(
    shared: &Arc<EngineShared>,
    subject: &Subject,
    sample_count: usize,
    mut on_progress: F,
) -> Result<EnrollReport, EngineError>
where
    F: FnMut(u8) + Send,
{
    if !shared.is_initialized() {
        return Err(EngineError::NotInitialized);
    }
    if sample_count == 0 {
        return Err(EngineError::InvalidSampleCount);
    }

    tracing::info!(subject = %subject, samples = sample_count, "enrollment started");
    let mut report = EnrollReport {
        requested: sample_count,
        captured: 0,
        stored: 0,
    };

    for i in 0..sample_count {
        if i > 0 {
            tokio::time::sleep(shared.options.enroll_sample_delay).await;
        }

        match shared.detect().await {
            Ok(Some(faces)) if faces.is_empty() => {
                tracing::debug!(sample = i, "no face in sample");
            }
            Ok(Some(faces)) => {
                if faces.len() > 1 {
                    tracing::warn!(sample = i, faces = faces.len(), "several faces in sample; storing all");
                }
                for face in &faces {
                    shared.store.add(subject, &face.descriptor).await?;
                    report.stored += 1;
                }
                report.captured += 1;
            }
            Ok(None) => {
                tracing::debug!(sample = i, "no frame available for sample");
            }
            Err(EngineError::Provider(e)) => {
                tracing::warn!(sample = i, error = %e, "face detection failed for sample");
            }
            Err(e) => return Err(e),
        }

        on_progress(progress(i + 1, sample_count));
    }

    if report.captured == 0 {
        tracing::warn!(subject = %subject, "enrollment captured no samples");
        return Err(EngineError::NoSamplesCaptured);
    }

    tracing::info!(
        subject = %subject,
        captured = report.captured,
        requested = report.requested,
        stored = report.stored,
        "enrollment finished"
    );
    Ok(report)
}
