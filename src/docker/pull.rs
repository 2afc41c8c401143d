//! Image pull with layer-by-layer progress aggregation
//!
//! Both the deployment executor and the update pipeline stream pulls
//! through here; they differ only in the event type they re-broadcast.

use std::collections::HashMap;
use std::time::Duration;

use bollard::auth::DockerCredentials;
use bollard::image::CreateImageOptions;
use bollard::models::CreateImageInfo;
use bollard::Docker;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::session::{SessionError, SessionResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerProgress {
    pub id: String,
    pub status: String,
    pub current: u64,
    pub total: u64,
    pub progress_percent: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullProgress {
    pub overall_progress: u8,
    pub layers: Vec<LayerProgress>,
    pub total_layers: usize,
    pub summary: String,
    pub speed_mbps: f64,
}

#[derive(Default)]
struct LayerState {
    status: String,
    current: u64,
    total: u64,
}

impl LayerState {
    fn complete(&self) -> bool {
        matches!(self.status.as_str(), "Pull complete" | "Already exists")
    }
}

/// Stream-side aggregator, separable from Docker for testing.
pub(crate) struct PullAggregator {
    layers: HashMap<String, LayerState>,
    order: Vec<String>,
    started: Instant,
}

impl PullAggregator {
    pub(crate) fn new() -> Self {
        Self {
            layers: HashMap::new(),
            order: Vec::new(),
            started: Instant::now(),
        }
    }

    pub(crate) fn observe(&mut self, info: &CreateImageInfo) -> PullProgress {
        if let Some(id) = info.id.as_deref() {
            if !self.layers.contains_key(id) {
                self.order.push(id.to_string());
            }
            let layer = self.layers.entry(id.to_string()).or_default();
            if let Some(status) = info.status.as_deref() {
                layer.status = status.to_string();
            }
            if let Some(detail) = &info.progress_detail {
                if let Some(current) = detail.current {
                    layer.current = layer.current.max(current as u64);
                }
                if let Some(total) = detail.total {
                    layer.total = total as u64;
                }
            }
            if layer.complete() && layer.total > 0 {
                layer.current = layer.total;
            }
        }
        self.snapshot()
    }

    fn snapshot(&self) -> PullProgress {
        let total_layers = self.order.len();
        let complete = self
            .order
            .iter()
            .filter(|id| self.layers[*id].complete())
            .count();

        let (done_bytes, total_bytes) = self.order.iter().fold((0u64, 0u64), |(d, t), id| {
            let layer = &self.layers[id];
            (d + layer.current, t + layer.total)
        });

        // Byte totals are only known for layers that started downloading,
        // so blend byte progress with the completed-layer count.
        let overall = if total_bytes > 0 {
            ((done_bytes as f64 / total_bytes as f64) * 100.0) as u8
        } else if total_layers > 0 {
            ((complete as f64 / total_layers as f64) * 100.0) as u8
        } else {
            0
        };

        let elapsed = self.started.elapsed().as_secs_f64();
        let speed_mbps = if elapsed > 0.0 {
            (done_bytes as f64 * 8.0) / (elapsed * 1_000_000.0)
        } else {
            0.0
        };

        let layers = self
            .order
            .iter()
            .map(|id| {
                let layer = &self.layers[id];
                LayerProgress {
                    id: id.clone(),
                    status: layer.status.clone(),
                    current: layer.current,
                    total: layer.total,
                    progress_percent: if layer.complete() {
                        100
                    } else if layer.total > 0 {
                        ((layer.current as f64 / layer.total as f64) * 100.0) as u8
                    } else {
                        0
                    },
                }
            })
            .collect();

        PullProgress {
            overall_progress: overall.min(100),
            layers,
            total_layers,
            summary: format!("{complete}/{total_layers} layers complete"),
            speed_mbps,
        }
    }
}

/// Pull an image, invoking `on_progress` for every layer update.
///
/// The deadline covers the whole pull; hitting it aborts the stream and
/// surfaces as a Docker error upstream.
pub async fn pull_image_with_progress<F>(
    docker: &Docker,
    image: &str,
    credentials: Option<DockerCredentials>,
    timeout: Duration,
    mut on_progress: F,
) -> SessionResult<()>
where
    F: FnMut(PullProgress),
{
    let options = Some(CreateImageOptions {
        from_image: image,
        ..Default::default()
    });

    let mut stream = docker.create_image(options, None, credentials);
    let mut aggregator = PullAggregator::new();

    let pull = async {
        while let Some(result) = stream.next().await {
            let info = result?;
            on_progress(aggregator.observe(&info));
        }
        Ok::<(), SessionError>(())
    };

    match tokio::time::timeout(timeout, pull).await {
        Ok(result) => result,
        Err(_) => Err(SessionError::Connect(
            format!("pull of {image} timed out after {}s", timeout.as_secs()),
            crate::events::OfflineReason::Unreachable,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::ProgressDetail;

    fn info(id: &str, status: &str, current: Option<i64>, total: Option<i64>) -> CreateImageInfo {
        CreateImageInfo {
            id: Some(id.to_string()),
            status: Some(status.to_string()),
            progress_detail: Some(ProgressDetail { current, total }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_overall_progress_tracks_bytes() {
        let mut agg = PullAggregator::new();
        agg.observe(&info("layer1", "Downloading", Some(50), Some(100)));
        let progress = agg.observe(&info("layer2", "Downloading", Some(0), Some(100)));

        assert_eq!(progress.total_layers, 2);
        assert_eq!(progress.overall_progress, 25);
        assert_eq!(progress.summary, "0/2 layers complete");
    }

    #[tokio::test]
    async fn test_layer_complete_counts_full_bytes() {
        let mut agg = PullAggregator::new();
        agg.observe(&info("layer1", "Downloading", Some(10), Some(100)));
        let progress = agg.observe(&info("layer1", "Pull complete", None, None));

        assert_eq!(progress.overall_progress, 100);
        assert_eq!(progress.layers[0].progress_percent, 100);
        assert_eq!(progress.summary, "1/1 layers complete");
    }

    #[tokio::test]
    async fn test_already_exists_is_complete() {
        let mut agg = PullAggregator::new();
        let progress = agg.observe(&info("layer1", "Already exists", None, None));
        assert_eq!(progress.summary, "1/1 layers complete");
        assert_eq!(progress.overall_progress, 100);
    }

    #[tokio::test]
    async fn test_progress_never_exceeds_100() {
        let mut agg = PullAggregator::new();
        // Reported current can overshoot total on retried chunks.
        let progress = agg.observe(&info("layer1", "Downloading", Some(150), Some(100)));
        assert!(progress.overall_progress <= 100);
    }
}
