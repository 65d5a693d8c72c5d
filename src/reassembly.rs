//! Raw frame reassembly and packetization.
//!
//! [`FrameReassembler`] turns the stream of sensor-data notifications into
//! fixed-length [`Packet`]s:
//!
//! 1. validate the frame shape against the family [`FrameGeometry`];
//! 2. compare the frame's sequence index with the previous one and
//!    synthesize gap samples for every lost frame;
//! 3. append the frame's raw samples to the raw buffer;
//! 4. once the raw buffer holds [`CONSOLIDATION_THRESHOLD`] samples, convert
//!    it to µV in one batch;
//! 5. cut exactly `sample_rate` samples per channel off the front of the
//!    consolidated buffer for every packet, scoring quality if configured.
//!
//! The reassembler is plain synchronous state: it performs no I/O and is
//! owned by exactly one task (see [`crate::supervisor`]).

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use log::{debug, warn};
use serde::Serialize;

use crate::protocol::{DeviceFamily, FrameGeometry, CONSOLIDATION_THRESHOLD};
use crate::types::{Packet, StreamError};

// ── Quality ──────────────────────────────────────────────────────────────────

/// Consumer-supplied per-channel signal quality score.
///
/// Called once per packet with `channels[c][t]` in µV (gap samples are
/// `NaN`).  Must return one value per channel.  Errors and panics are caught;
/// the packet is then emitted with an all-`NaN` quality vector.
pub trait QualityChecker: Send + Sync {
    fn compute(&self, channels: &[Vec<f64>], sample_rate: usize) -> anyhow::Result<Vec<f64>>;
}

impl<F> QualityChecker for F
where
    F: Fn(&[Vec<f64>], usize) -> anyhow::Result<Vec<f64>> + Send + Sync,
{
    fn compute(&self, channels: &[Vec<f64>], sample_rate: usize) -> anyhow::Result<Vec<f64>> {
        self(channels, sample_rate)
    }
}

// ── Configuration ─────────────────────────────────────────────────────────────

/// Settings for one streaming session.
#[derive(Debug, Clone, PartialEq)]
pub struct ReassemblerConfig {
    pub geometry: FrameGeometry,
    /// Frames carry a status bitmask after the index.
    pub trigger: bool,
    /// Raw samples buffered before a batch conversion.
    pub consolidation_threshold: usize,
    /// Largest index jump that is gap-filled; anything beyond re-seeds the
    /// sequence instead of synthesizing an unbounded run of gap samples.
    pub max_gap_frames: u64,
}

/// Default [`ReassemblerConfig::max_gap_frames`].
pub const DEFAULT_MAX_GAP_FRAMES: u64 = 1_000;

impl ReassemblerConfig {
    pub fn for_family(family: DeviceFamily) -> Self {
        Self {
            geometry: family.geometry(),
            trigger: false,
            consolidation_threshold: CONSOLIDATION_THRESHOLD,
            max_gap_frames: DEFAULT_MAX_GAP_FRAMES,
        }
    }
}

// ── Samples and statistics ────────────────────────────────────────────────────

/// One timestep as it came off the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum RawSample {
    /// Synthesized for a lost frame; converts to `NaN` everywhere.
    Gap,
    /// `channel_count × sample_alloc_size` raw bytes, channel-major, plus the
    /// status bit when triggers are enabled.
    Wire { bytes: Vec<u8>, status: Option<bool> },
}

impl RawSample {
    pub fn is_gap(&self) -> bool {
        matches!(self, RawSample::Gap)
    }
}

/// Error counters for one streaming session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub frames_received: u64,
    pub frames_invalid: u64,
    pub frames_duplicate: u64,
    /// Frames detected as lost from index gaps.
    pub frames_missing: u64,
    /// Number of distinct gaps (each may span several frames).
    pub gap_events: u64,
    pub resyncs: u64,
    pub samples_synthesized: u64,
    /// Frames discarded by the dispatch ring before processing.
    pub frames_shed: u64,
    pub packets_emitted: u64,
}

/// Result of feeding one frame.
#[derive(Debug, Default)]
pub struct Ingest {
    pub packets: Vec<Packet>,
    pub errors: Vec<StreamError>,
}

// ── Reassembler ───────────────────────────────────────────────────────────────

/// Stateful frame → packet converter.  See the module docs for the pipeline.
pub struct FrameReassembler {
    config: ReassemblerConfig,
    quality: Option<Arc<dyn QualityChecker>>,
    /// `None` until the first valid frame after a reset.
    previous_index: Option<u64>,
    raw: Vec<RawSample>,
    /// Consolidated µV values, `channels[c][t]`.
    channels: Vec<Vec<f64>>,
    status: Vec<f64>,
    next_packet: u64,
    stats: StreamStats,
}

impl FrameReassembler {
    pub fn new(mut config: ReassemblerConfig, quality: Option<Arc<dyn QualityChecker>>) -> Self {
        config.geometry.sample_rate = config.geometry.sample_rate.max(1);
        config.consolidation_threshold = config.consolidation_threshold.max(1);
        let channel_count = config.geometry.channel_count;
        Self {
            config,
            quality,
            previous_index: None,
            raw: Vec::with_capacity(CONSOLIDATION_THRESHOLD * 2),
            channels: vec![Vec::new(); channel_count],
            status: Vec::new(),
            next_packet: 0,
            stats: StreamStats::default(),
        }
    }

    pub fn config(&self) -> &ReassemblerConfig {
        &self.config
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    /// Count frames dropped upstream before they reached [`Self::ingest`].
    pub fn record_shed(&mut self, frames: usize) {
        self.stats.frames_shed += frames as u64;
    }

    /// Raw samples not yet consolidated.
    pub fn raw_buffer(&self) -> &[RawSample] {
        &self.raw
    }

    /// Consolidated samples per channel not yet cut into a packet.
    pub fn buffered_samples(&self) -> usize {
        self.status.len()
    }

    /// Drop every buffer and counter and forget the previous index.
    pub fn reset(&mut self) {
        self.previous_index = None;
        self.raw.clear();
        for ch in &mut self.channels {
            ch.clear();
        }
        self.status.clear();
        self.next_packet = 0;
        self.stats = StreamStats::default();
    }

    /// Feed one raw sensor-data notification.
    pub fn ingest(&mut self, frame: &[u8]) -> Ingest {
        let mut out = Ingest::default();
        let geometry = self.config.geometry;
        let header = geometry.header_len(self.config.trigger);
        let step = geometry.timestep_len();

        let Some(samples_per_frame) = self.frame_sample_count(frame.len(), header, step) else {
            self.stats.frames_invalid += 1;
            warn!(
                "dropping malformed frame: len={} header={header} timestep={step}",
                frame.len()
            );
            out.errors.push(StreamError::InvalidFrame { len: frame.len() });
            return out;
        };
        let Some(index) = geometry.read_index(frame) else {
            self.stats.frames_invalid += 1;
            out.errors.push(StreamError::InvalidFrame { len: frame.len() });
            return out;
        };
        self.stats.frames_received += 1;

        let modulus = geometry.index_modulus();
        let previous = *self
            .previous_index
            .get_or_insert((index + modulus - 1) % modulus);
        let delta = (index + modulus - previous) % modulus;

        match delta {
            0 => {
                self.stats.frames_duplicate += 1;
                debug!("dropping duplicate frame index={index}");
                return out;
            }
            1 => {}
            d if d - 1 > self.config.max_gap_frames => {
                self.stats.resyncs += 1;
                warn!("index jumped {previous} -> {index}; re-seeding without gap fill");
                out.errors.push(StreamError::Resynchronized {
                    from_index: previous,
                    to_index: index,
                });
            }
            d => {
                let missing = d - 1;
                let gap_samples = missing as usize * samples_per_frame;
                self.stats.frames_missing += missing;
                self.stats.gap_events += 1;
                self.stats.samples_synthesized += gap_samples as u64;
                debug!("{missing} frame(s) lost before index {index}; filling {gap_samples} samples");
                self.raw
                    .extend(std::iter::repeat(RawSample::Gap).take(gap_samples));
                out.errors.push(StreamError::MissingFrames {
                    count: missing,
                    at_index: index,
                });
            }
        }

        let status_bits = &frame[geometry.index_size..header];
        for t in 0..samples_per_frame {
            let start = header + t * step;
            let status = self
                .config
                .trigger
                .then(|| (status_bits[t / 8] >> (t % 8)) & 1 == 1);
            self.raw.push(RawSample::Wire {
                bytes: frame[start..start + step].to_vec(),
                status,
            });
        }
        self.previous_index = Some(index);

        if self.raw.len() >= self.config.consolidation_threshold {
            self.consolidate();
        }
        self.packetize(&mut out);
        out
    }

    /// Number of timesteps in a frame of `len` bytes, or `None` if the frame
    /// is not `header + k × timestep` with `k ≥ 1` (and, with triggers,
    /// `k` fits in the status bitmask).
    fn frame_sample_count(&self, len: usize, header: usize, step: usize) -> Option<usize> {
        let body = len.checked_sub(header)?;
        if step == 0 || body == 0 || body % step != 0 {
            return None;
        }
        let samples = body / step;
        if self.config.trigger && samples > self.config.geometry.status_size * 8 {
            return None;
        }
        Some(samples)
    }

    /// Convert the whole raw buffer to µV and append it to the consolidated
    /// buffers.
    fn consolidate(&mut self) {
        let geometry = self.config.geometry;
        for sample in self.raw.drain(..) {
            match sample {
                RawSample::Gap => {
                    for ch in &mut self.channels {
                        ch.push(f64::NAN);
                    }
                    self.status.push(f64::NAN);
                }
                RawSample::Wire { bytes, status } => {
                    for (ch, raw) in self
                        .channels
                        .iter_mut()
                        .zip(bytes.chunks_exact(geometry.sample_alloc_size))
                    {
                        ch.push(geometry.decode_sample(raw));
                    }
                    self.status.push(match status {
                        Some(true) => 1.0,
                        Some(false) => 0.0,
                        None => f64::NAN,
                    });
                }
            }
        }
    }

    fn packetize(&mut self, out: &mut Ingest) {
        let rate = self.config.geometry.sample_rate;
        while self.status.len() >= rate {
            let channels: Vec<Vec<f64>> = self
                .channels
                .iter_mut()
                .map(|ch| ch.drain(..rate).collect())
                .collect();
            let status: Vec<f64> = self.status.drain(..rate).collect();
            let quality = match self.score(&channels) {
                Ok(q) => q,
                Err(reason) => {
                    warn!("quality computation failed: {reason}");
                    out.errors.push(StreamError::QualityFailed(reason));
                    vec![f64::NAN; channels.len()]
                }
            };
            out.packets.push(Packet {
                sequence: self.next_packet,
                sample_rate: rate,
                channels,
                status,
                quality,
            });
            self.next_packet += 1;
            self.stats.packets_emitted += 1;
        }
    }

    fn score(&self, channels: &[Vec<f64>]) -> Result<Vec<f64>, String> {
        let Some(checker) = &self.quality else {
            return Ok(vec![f64::NAN; channels.len()]);
        };
        let rate = self.config.geometry.sample_rate;
        match panic::catch_unwind(AssertUnwindSafe(|| checker.compute(channels, rate))) {
            Ok(Ok(scores)) if scores.len() == channels.len() => Ok(scores),
            Ok(Ok(scores)) => Err(format!(
                "{} scores for {} channels",
                scores.len(),
                channels.len()
            )),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("quality function panicked".into()),
        }
    }
}
