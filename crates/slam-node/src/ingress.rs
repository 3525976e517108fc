//! ---
//! slam_section: "01-core-functionality"
//! slam_subsection: "module"
//! slam_type: "source"
//! slam_scope: "code"
//! slam_description: "Node controller, sensor ingress and run sequence."
//! slam_version: "v0.0.0-prealpha"
//! slam_owner: "tbd"
//! ---
//! Entry point for sensor callbacks arriving on transport threads.

use std::collections::BTreeMap;
use std::sync::Weak;

use parking_lot::Mutex;
use slam_common::{SensorKind, TrajectoryOptions};
use slam_engine::{SensorSample, TrajectoryId};
use tracing::trace;

use crate::controller::Shared;
use crate::error::SensorInputError;

/// Deterministically keeps a fixed fraction of the pulses it sees.
#[derive(Debug, Clone)]
pub struct FixedRatioSampler {
    ratio: f64,
    pulses: u64,
    samples: u64,
}

impl FixedRatioSampler {
    pub fn new(ratio: f64) -> Self {
        Self {
            ratio,
            pulses: 0,
            samples: 0,
        }
    }

    /// Returns `true` when this pulse should be kept.
    pub fn pulse(&mut self) -> bool {
        self.pulses += 1;
        if (self.samples as f64) / (self.pulses as f64) < self.ratio {
            self.samples += 1;
            true
        } else {
            false
        }
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }
}

#[derive(Debug)]
struct TopicBinding {
    kind: SensorKind,
    sampler: Mutex<FixedRatioSampler>,
}

/// Per-trajectory subscription table held by the controller.
#[derive(Debug)]
pub(crate) struct TrajectoryBinding {
    pub(crate) options: TrajectoryOptions,
    pub(crate) active: bool,
    topics: BTreeMap<String, TopicBinding>,
}

impl TrajectoryBinding {
    pub(crate) fn new(options: TrajectoryOptions) -> Self {
        let topics = options
            .expected_sensor_ids()
            .into_iter()
            .map(|id| {
                let binding = TopicBinding {
                    kind: id.kind,
                    sampler: Mutex::new(FixedRatioSampler::new(options.sampling_ratio(id.kind))),
                };
                (id.topic, binding)
            })
            .collect();
        Self {
            options,
            active: true,
            topics,
        }
    }

    pub(crate) fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }
}

/// What happened to a delivered sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleDisposition {
    Accepted,
    SampledOut,
}

/// Cloneable handle given to the transport layer.
///
/// The handle does not keep the node alive; once the controller is dropped
/// every delivery fails with [`SensorInputError::NodeGone`].
#[derive(Debug, Clone)]
pub struct SensorIngress {
    shared: Weak<Shared>,
}

impl SensorIngress {
    pub(crate) fn new(shared: Weak<Shared>) -> Self {
        Self { shared }
    }

    /// Deliver one sample to `trajectory_id`.
    ///
    /// Holds the shared side of the binding lock for the whole delivery, so
    /// finishing trajectories waits for in-flight samples.
    pub fn handle_sample(
        &self,
        trajectory_id: TrajectoryId,
        sample: SensorSample,
    ) -> Result<SampleDisposition, SensorInputError> {
        let shared = self.shared.upgrade().ok_or(SensorInputError::NodeGone)?;
        let kind = sample.data.kind();
        let result = deliver(&shared, trajectory_id, sample);
        if let Some(metrics) = &shared.metrics {
            let disposition = match &result {
                Ok(SampleDisposition::Accepted) => "accepted",
                Ok(SampleDisposition::SampledOut) => "sampled_out",
                Err(_) => "rejected",
            };
            metrics.record_sensor_sample(kind_label(kind), disposition);
        }
        result
    }
}

fn deliver(
    shared: &Shared,
    trajectory_id: TrajectoryId,
    sample: SensorSample,
) -> Result<SampleDisposition, SensorInputError> {
    let bindings = shared.bindings.read();
    let binding = bindings
        .get(&trajectory_id)
        .filter(|binding| binding.active)
        .ok_or(SensorInputError::TrajectoryNotActive(trajectory_id))?;
    let kind = sample.data.kind();
    let topic = binding
        .topics
        .get(&sample.topic)
        .filter(|topic| topic.kind == kind)
        .ok_or_else(|| SensorInputError::UnknownTopic {
            trajectory_id,
            topic: sample.topic.clone(),
            kind: kind_label(kind).to_owned(),
        })?;
    if !topic.sampler.lock().pulse() {
        trace!(trajectory_id = %trajectory_id, topic = %sample.topic, "sample dropped by sampler");
        return Ok(SampleDisposition::SampledOut);
    }
    shared.engine.read().add_sensor_data(trajectory_id, sample)?;
    Ok(SampleDisposition::Accepted)
}

pub(crate) fn kind_label(kind: SensorKind) -> &'static str {
    match kind {
        SensorKind::Range => "range",
        SensorKind::Imu => "imu",
        SensorKind::Odometry => "odometry",
        SensorKind::FixedFramePose => "fixed_frame_pose",
        SensorKind::Landmark => "landmark",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_ratio_keeps_everything() {
        let mut sampler = FixedRatioSampler::new(1.0);
        assert!((0..100).all(|_| sampler.pulse()));
    }

    #[test]
    fn quarter_ratio_keeps_every_fourth_pulse() {
        let mut sampler = FixedRatioSampler::new(0.25);
        let kept: Vec<bool> = (0..8).map(|_| sampler.pulse()).collect();
        assert_eq!(
            kept,
            vec![true, false, false, false, true, false, false, false]
        );
    }

    #[test]
    fn kept_fraction_converges_to_ratio() {
        let mut sampler = FixedRatioSampler::new(0.3);
        let kept = (0..1000).filter(|_| sampler.pulse()).count();
        assert_eq!(kept, 300);
    }
}
