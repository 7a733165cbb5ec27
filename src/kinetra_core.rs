/* src/kinetra_core.rs */
#![warn(missing_docs, clippy::pedantic)]
#![allow(
    clippy::excessive_precision,
    clippy::too_many_arguments,
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::struct_excessive_bools
)]
//! # Kinetra: Diffusion-Policy Inference Core
//!
//! Real-time inference core for a trained robot-control diffusion policy.
//! Receives multi-modal observations (point clouds, proprioception, camera
//! frames), fuses them into a conditioning feature vector, and runs an
//! iterative conditional denoising loop that refines Gaussian noise into a
//! short horizon of future actions.
//!
//! ## Core Features
//!
//! - Per-field affine normalization with exact inverses
//! - Multi-modal observation fusion with depth/wrist channel policies
//! - Conditioning-mask protocol enforced at every denoising step
//! - DDPM reverse-process sampling with seeded determinism
//! - Checkpoint bundles loaded once, read-only for the process lifetime
//!
/*▫~•◦────────────────────────────────────────────────────────────────────────────────────‣
 * © 2025 ArcMoon Studios ◦ SPDX-License-Identifier MIT OR Apache-2.0 ◦ Author: Lord Xyn ✶
 *///◦────────────────────────────────────────────────────────────────────────────────────‣

// =====================================================================================
// DEPENDENCY IMPORTS - BEST-IN-CLASS CRATES
// =====================================================================================

use std::f32::consts::PI;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use hashbrown::HashMap as FastMap;
use ndarray::{
    concatenate, s, stack, Array1, Array2, Array3, Array4, Array5, ArrayD, ArrayView2, Axis,
    Dimension, Ix3,
};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace};

// =====================================================================================
// ERROR HANDLING & METRICS INFRASTRUCTURE
// =====================================================================================

/// Unified error type for the Kinetra engine, providing structured, contextual error information.
///
/// Configuration errors are fatal to the instance they occur in and are raised
/// at construction or first use. Transport and inference errors are scoped to
/// a single request and must never terminate the serving process.
#[derive(Error, Debug)]
pub enum KinetraError {
    /// An error related to policy construction, shape metadata, or normalizer state.
    #[error("Configuration Error: {0}")]
    Configuration(String),

    /// A malformed or undecodable request payload; recoverable per-request.
    #[error("Transport Error: {message}")]
    Transport {
        /// Description of the transport failure
        message: String,
    },

    /// An error raised inside network evaluation or by numeric instability during sampling.
    #[error("Inference Error: {message}")]
    Inference {
        /// Description of the inference failure
        message: String,
    },

    /// A checkpoint bundle that could not be read, verified, or written.
    #[error("Checkpoint Error: {message}")]
    Checkpoint {
        /// Description of the checkpoint failure
        message: String,
    },

    /// An error related to system I/O or external dependencies.
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized `Result` type for Kinetra engine operations.
pub type Result<T> = std::result::Result<T, KinetraError>;

impl KinetraError {
    /// Shorthand constructor for [`KinetraError::Inference`].
    #[inline]
    #[must_use]
    pub fn inference(message: impl Into<String>) -> Self {
        Self::Inference {
            message: message.into(),
        }
    }

    /// Shorthand constructor for [`KinetraError::Transport`].
    #[inline]
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }
}

fn shape_err(context: &str, e: ndarray::ShapeError) -> KinetraError {
    KinetraError::Configuration(format!("{context}: {e}"))
}

/// A counter metric that emits structured logs with `tracing`.
#[derive(Debug)]
pub struct Counter {
    /// Name of the counter metric.
    name: &'static str,
    /// Atomic value of the counter.
    value: AtomicU64,
}

impl Counter {
    /// Creates a new `Counter` with the given name.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicU64::new(0),
        }
    }

    /// Increments the counter by a given delta.
    pub fn increment(&self, delta: u64) {
        let new_value = self.value.fetch_add(delta, Ordering::Relaxed) + delta;
        trace!(
            metric_type = "counter",
            metric_name = self.name,
            value = new_value,
            delta,
            "Counter incremented"
        );
    }

    /// Current counter value.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A histogram metric that emits structured logs with `tracing`.
#[derive(Debug)]
pub struct Histogram {
    /// Name of the histogram metric.
    name: &'static str,
}

impl Histogram {
    /// Creates a new `Histogram` with the given name.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self { name }
    }

    /// Records a single observation.
    pub fn record(&self, value: f64) {
        debug!(
            metric_type = "histogram",
            metric_name = self.name,
            value,
            "Histogram value recorded"
        );
    }
}

/// Creates or retrieves a static `Counter` instance.
macro_rules! counter {
    ($name:expr) => {{
        static COUNTER: Counter = Counter::new($name);
        &COUNTER
    }};
}

/// Creates or retrieves a static `Histogram` instance.
macro_rules! histogram {
    ($name:expr) => {{
        static HISTOGRAM: Histogram = Histogram::new($name);
        &HISTOGRAM
    }};
}

// =====================================================================================
// EXECUTION CONTEXT
// =====================================================================================

/// Compute device selection for tensor work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComputeDevice {
    /// Host CPU execution.
    Cpu,
}

impl fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeDevice::Cpu => write!(f, "cpu"),
        }
    }
}

/// Numeric precision used for policy tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NumericPrecision {
    /// 32-bit IEEE-754 floating point.
    F32,
}

/// Explicit execution context threaded through every policy call.
///
/// Replaces ambient per-object device/dtype state: callers always know which
/// device and precision a tensor was produced for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecContext {
    /// Target compute device.
    pub device: ComputeDevice,
    /// Numeric precision for trajectory and feature tensors.
    pub precision: NumericPrecision,
}

impl Default for ExecContext {
    fn default() -> Self {
        Self {
            device: ComputeDevice::Cpu,
            precision: NumericPrecision::F32,
        }
    }
}

// =====================================================================================
// OBSERVATION DATA MODEL
// =====================================================================================

/// Modality presence profile, resolved once at policy construction.
///
/// The serving path never re-inspects which modalities exist per call; the
/// profile decided here is the contract for every subsequent request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ObservationProfile {
    /// Wrist camera / wrist point cloud enabled.
    pub use_wrist: bool,
    /// Depth channel fused into the image tensor.
    pub use_depth: bool,
    /// Depth replaces the image channels entirely.
    pub use_depth_only: bool,
}

/// A batch of multi-modal observations with explicit optional fields.
///
/// All present modalities share the leading `[batch, time_steps]` dimensions.
/// Point clouds are `[B, T, N, 3]`, proprioceptive state is `[B, T, D]`,
/// images are `[B, T, C, H, W]` (or `[B, T, H, W, C]` before layout
/// normalization), depth maps are `[B, T, H, W]`.
#[derive(Debug, Clone, Default)]
pub struct ObservationBatch {
    /// Main point cloud, `[B, T, N, 3]`.
    pub point_cloud: Option<Array4<f32>>,
    /// Wrist-mounted point cloud, `[B, T, N, 3]`.
    pub wrist_point_cloud: Option<Array4<f32>>,
    /// Proprioceptive state, `[B, T, D]`.
    pub agent_pos: Option<Array3<f32>>,
    /// Main camera frames, `[B, T, C, H, W]` or `[B, T, H, W, C]`.
    pub image: Option<Array5<f32>>,
    /// Depth maps, `[B, T, H, W]`.
    pub depth: Option<Array4<f32>>,
    /// Wrist camera frames, layout as `image`.
    pub wrist_image: Option<Array5<f32>>,
}

impl ObservationBatch {
    /// Returns the shared `[batch, time_steps]` leading dimensions.
    ///
    /// # Errors
    /// `Configuration` if the batch is empty or the present modalities
    /// disagree on their leading dimensions.
    pub fn leading_dims(&self) -> Result<(usize, usize)> {
        let mut dims: Option<(usize, usize)> = None;
        let mut check = |name: &str, lead: (usize, usize)| -> Result<()> {
            match dims {
                None => {
                    dims = Some(lead);
                    Ok(())
                }
                Some(expected) if expected == lead => Ok(()),
                Some(expected) => Err(KinetraError::Configuration(format!(
                    "modality {name} has leading dims {lead:?}, expected {expected:?}"
                ))),
            }
        };
        if let Some(a) = &self.point_cloud {
            check("point_cloud", (a.shape()[0], a.shape()[1]))?;
        }
        if let Some(a) = &self.wrist_point_cloud {
            check("wrist_point_cloud", (a.shape()[0], a.shape()[1]))?;
        }
        if let Some(a) = &self.agent_pos {
            check("agent_pos", (a.shape()[0], a.shape()[1]))?;
        }
        if let Some(a) = &self.image {
            check("image", (a.shape()[0], a.shape()[1]))?;
        }
        if let Some(a) = &self.depth {
            check("depth", (a.shape()[0], a.shape()[1]))?;
        }
        if let Some(a) = &self.wrist_image {
            check("wrist_image", (a.shape()[0], a.shape()[1]))?;
        }
        dims.ok_or_else(|| {
            KinetraError::Configuration("observation batch contains no modalities".into())
        })
    }

    /// Restricts every present modality to the first `n_obs_steps` timesteps.
    pub fn window(&self, n_obs_steps: usize) -> Result<ObservationBatch> {
        let (_, t) = self.leading_dims()?;
        if n_obs_steps == 0 || n_obs_steps > t {
            return Err(KinetraError::Configuration(format!(
                "observation window {n_obs_steps} invalid for {t} available timesteps"
            )));
        }
        let to = n_obs_steps;
        Ok(ObservationBatch {
            point_cloud: self
                .point_cloud
                .as_ref()
                .map(|a| a.slice(s![.., ..to, .., ..]).to_owned()),
            wrist_point_cloud: self
                .wrist_point_cloud
                .as_ref()
                .map(|a| a.slice(s![.., ..to, .., ..]).to_owned()),
            agent_pos: self
                .agent_pos
                .as_ref()
                .map(|a| a.slice(s![.., ..to, ..]).to_owned()),
            image: self
                .image
                .as_ref()
                .map(|a| a.slice(s![.., ..to, .., .., ..]).to_owned()),
            depth: self
                .depth
                .as_ref()
                .map(|a| a.slice(s![.., ..to, .., ..]).to_owned()),
            wrist_image: self
                .wrist_image
                .as_ref()
                .map(|a| a.slice(s![.., ..to, .., .., ..]).to_owned()),
        })
    }
}

/// Verifies that a tensor contains only finite values.
///
/// Numeric instability inside sampling is never masked by the sampler itself;
/// this is the caller-side validation gate.
pub fn ensure_finite<D: Dimension>(what: &str, x: &ndarray::Array<f32, D>) -> Result<()> {
    if x.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(KinetraError::inference(format!(
            "{what} contains NaN or Inf values"
        )))
    }
}

// =====================================================================================
// LINEAR NORMALIZER
// =====================================================================================

/// Per-field affine transform state.
///
/// `Affine` maps raw values into `[-1, 1]` via `(x - offset) / scale` over the
/// trailing feature axis; `Identity` passes values through untouched and is
/// used for modalities that already live in a stable range (point clouds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FieldNormalizer {
    /// Per-dimension affine parameters over the trailing axis.
    Affine {
        /// Per-dimension half-range, `(max - min) / 2`.
        scale: Array1<f32>,
        /// Per-dimension mid-point, `(max + min) / 2`.
        offset: Array1<f32>,
    },
    /// Pass-through for modalities in a stable range.
    Identity,
}

impl FieldNormalizer {
    /// Fits affine parameters from per-dimension minima and maxima.
    ///
    /// Degenerate dimensions (`max == min`) fall back to identity scaling so
    /// the inverse stays exact.
    #[must_use]
    pub fn fit_range(min: &Array1<f32>, max: &Array1<f32>) -> Self {
        let scale = min
            .iter()
            .zip(max.iter())
            .map(|(&lo, &hi)| {
                let half = (hi - lo) / 2.0;
                if half.abs() < 1e-12 {
                    1.0
                } else {
                    half
                }
            })
            .collect::<Array1<f32>>();
        let offset = min
            .iter()
            .zip(max.iter())
            .map(|(&lo, &hi)| (hi + lo) / 2.0)
            .collect::<Array1<f32>>();
        FieldNormalizer::Affine { scale, offset }
    }

    /// Unit affine parameters: normalization is the identity map but the
    /// field still counts as fitted.
    #[must_use]
    pub fn unit(dim: usize) -> Self {
        FieldNormalizer::Affine {
            scale: Array1::ones(dim),
            offset: Array1::zeros(dim),
        }
    }

    fn apply(&self, x: &ArrayD<f32>, forward: bool) -> Result<ArrayD<f32>> {
        match self {
            FieldNormalizer::Identity => Ok(x.clone()),
            FieldNormalizer::Affine { scale, offset } => {
                let last = x.ndim().checked_sub(1).ok_or_else(|| {
                    KinetraError::Configuration("cannot normalize a 0-d tensor".into())
                })?;
                if x.shape()[last] != scale.len() {
                    return Err(KinetraError::Configuration(format!(
                        "normalizer fitted for {} dims, tensor trailing axis has {}",
                        scale.len(),
                        x.shape()[last]
                    )));
                }
                let mut out = x.clone();
                for mut lane in out.lanes_mut(Axis(last)) {
                    for (v, (&sc, &of)) in lane.iter_mut().zip(scale.iter().zip(offset.iter())) {
                        *v = if forward {
                            (*v - of) / sc
                        } else {
                            *v * sc + of
                        };
                    }
                }
                Ok(out)
            }
        }
    }
}

/// Stateless-after-fit normalizer over named observation/action fields.
///
/// Statistics are fit once from training data and persisted inside the
/// checkpoint bundle; serving loads them read-only. Requesting a field whose
/// statistics were never fit is a configuration error, not a silent identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinearNormalizer {
    fields: FastMap<String, FieldNormalizer>,
}

impl LinearNormalizer {
    /// Creates an empty normalizer with no fitted fields.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers fitted parameters for a field.
    pub fn insert(&mut self, field: impl Into<String>, normalizer: FieldNormalizer) {
        self.fields.insert(field.into(), normalizer);
    }

    /// Names of all fitted fields.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    fn get(&self, field: &str) -> Result<&FieldNormalizer> {
        self.fields.get(field).ok_or_else(|| {
            KinetraError::Configuration(format!(
                "normalizer statistics for field '{field}' were never fit"
            ))
        })
    }

    /// Applies the forward transform for one field.
    pub fn normalize(&self, field: &str, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        self.get(field)?.apply(x, true)
    }

    /// Applies the inverse transform for one field.
    pub fn unnormalize(&self, field: &str, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        self.get(field)?.apply(x, false)
    }

    /// Normalizes every recognized field of an observation batch.
    ///
    /// Recognized fields: `agent_pos`, `point_cloud`, `wrist_point_cloud`.
    /// Image and depth tensors pass through unchanged; their scaling is the
    /// fusion pipeline's concern.
    pub fn normalize_batch(&self, batch: &ObservationBatch) -> Result<ObservationBatch> {
        let mut out = batch.clone();
        if let Some(a) = &batch.agent_pos {
            let n = self.normalize("agent_pos", &a.clone().into_dyn())?;
            out.agent_pos = Some(
                n.into_dimensionality::<Ix3>()
                    .map_err(|e| shape_err("agent_pos", e))?,
            );
        }
        if let Some(a) = &batch.point_cloud {
            let n = self.normalize("point_cloud", &a.clone().into_dyn())?;
            out.point_cloud = Some(
                n.into_dimensionality::<ndarray::Ix4>()
                    .map_err(|e| shape_err("point_cloud", e))?,
            );
        }
        if let Some(a) = &batch.wrist_point_cloud {
            let n = self.normalize("wrist_point_cloud", &a.clone().into_dyn())?;
            out.wrist_point_cloud = Some(
                n.into_dimensionality::<ndarray::Ix4>()
                    .map_err(|e| shape_err("wrist_point_cloud", e))?,
            );
        }
        Ok(out)
    }
}

// =====================================================================================
// POINT-CLOUD RESAMPLING
// =====================================================================================

/// Fixed-size point-cloud resampling collaborator.
///
/// The upstream preprocessing filter is opaque to the policy; the only
/// contract is a uniform resample to a fixed point count per frame.
pub trait CloudResampler: Send + Sync {
    /// Resamples `[T, N, 3]` to `[T, target, 3]`.
    fn resample(&self, cloud: &Array3<f32>, target: usize) -> Result<Array3<f32>>;
}

/// Uniform random resampler: without replacement when enough points exist,
/// with replacement otherwise.
#[derive(Debug, Clone, Copy)]
pub struct UniformResampler {
    /// Base seed; per-frame streams derive from it so frames resample
    /// independently and deterministically.
    pub seed: u64,
}

impl Default for UniformResampler {
    fn default() -> Self {
        Self { seed: 0x5EED }
    }
}

impl UniformResampler {
    fn resample_frame(&self, frame: ArrayView2<'_, f32>, target: usize, stream: u64) -> Array2<f32> {
        let n = frame.shape()[0];
        let mut rng = fastrand::Rng::with_seed(self.seed ^ stream);
        let mut out = Array2::zeros((target, frame.shape()[1]));
        if n >= target {
            // Partial Fisher-Yates over the index range.
            let mut indices: Vec<usize> = (0..n).collect();
            for i in 0..target {
                let j = i + rng.usize(..n - i);
                indices.swap(i, j);
            }
            for (row, &idx) in indices[..target].iter().enumerate() {
                out.row_mut(row).assign(&frame.row(idx));
            }
        } else {
            for row in 0..target {
                let idx = rng.usize(..n);
                out.row_mut(row).assign(&frame.row(idx));
            }
        }
        out
    }
}

impl CloudResampler for UniformResampler {
    fn resample(&self, cloud: &Array3<f32>, target: usize) -> Result<Array3<f32>> {
        let (t, n, c) = cloud.dim();
        if n == 0 || target == 0 {
            return Err(KinetraError::Configuration(format!(
                "cannot resample {n} points to {target}"
            )));
        }
        if c != 3 {
            return Err(KinetraError::Configuration(format!(
                "point cloud must have 3 coordinate channels, got {c}"
            )));
        }
        if n == target {
            return Ok(cloud.clone());
        }
        let frames: Vec<Array2<f32>> = (0..t)
            .into_par_iter()
            .map(|ti| self.resample_frame(cloud.index_axis(Axis(0), ti), target, ti as u64))
            .collect();
        let views: Vec<_> = frames.iter().map(|f| f.view()).collect();
        stack(Axis(0), &views).map_err(|e| shape_err("resampled cloud", e))
    }
}

// =====================================================================================
// NETWORK COLLABORATOR INTERFACES
// =====================================================================================

/// Opaque observation encoder collaborator.
///
/// Consumes a windowed, fused observation batch and emits per-step feature
/// vectors `[B, n_obs_steps, feature_dim]`. The declared output shape is the
/// per-step feature shape; the policy derives its conditioning dimensions
/// from its product once, at construction.
pub trait ObservationEncoder: Send + Sync {
    /// Encodes a windowed batch into per-step features.
    fn encode(&self, obs: &ObservationBatch) -> Result<Array3<f32>>;

    /// Declared per-step output shape.
    fn output_shape(&self) -> &[usize];
}

/// Opaque denoising network collaborator.
///
/// Evaluates one reverse-diffusion step: given the current trajectory
/// `[B, T, D]`, the discrete timestep, and an optional global conditioning
/// vector `[B, C]`, produces a tensor of the trajectory's shape holding
/// either a noise-residual estimate or a direct sample estimate, matching the
/// schedule's configured prediction type.
pub trait DenoiseNetwork: Send + Sync {
    /// Runs one denoising evaluation.
    fn forward(
        &self,
        trajectory: &Array3<f32>,
        timestep: usize,
        global_cond: Option<&Array2<f32>>,
    ) -> Result<Array3<f32>>;
}

/// GELU activation.
#[inline]
fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + ((2.0_f32 / PI).sqrt() * (x + 0.044715 * x * x * x)).tanh())
}

/// Sinusoidal embedding of a discrete diffusion timestep.
fn timestep_embedding(timestep: usize, dim: usize) -> Array1<f32> {
    let half = (dim / 2).max(1);
    let mut emb = Array1::zeros(dim);
    let t = timestep as f32;
    for i in 0..half {
        let freq = (-(10_000.0_f32.ln()) * i as f32 / half as f32).exp();
        emb[i] = (t * freq).sin();
        if half + i < dim {
            emb[half + i] = (t * freq).cos();
        }
    }
    emb
}

/// A dense layer with Xavier-initialized weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearLayer {
    weight: Array2<f32>,
    bias: Array1<f32>,
}

impl LinearLayer {
    /// Creates a layer with Xavier-uniform initialization from a seeded generator.
    #[must_use]
    pub fn seeded(rng: &mut StdRng, in_dim: usize, out_dim: usize) -> Self {
        let bound = (6.0_f32 / (in_dim + out_dim) as f32).sqrt();
        let weight =
            Array2::from_shape_simple_fn((out_dim, in_dim), || rng.random_range(-bound..bound));
        Self {
            weight,
            bias: Array1::zeros(out_dim),
        }
    }

    /// Input dimensionality.
    #[must_use]
    pub fn in_dim(&self) -> usize {
        self.weight.shape()[1]
    }

    /// Output dimensionality.
    #[must_use]
    pub fn out_dim(&self) -> usize {
        self.weight.shape()[0]
    }

    /// Applies the layer to a single vector.
    #[must_use]
    pub fn forward(&self, x: &Array1<f32>) -> Array1<f32> {
        self.weight.dot(x) + &self.bias
    }

    /// Applies the layer to a batch of row vectors `[N, in] -> [N, out]`.
    #[must_use]
    pub fn forward_batch(&self, x: &Array2<f32>) -> Array2<f32> {
        x.dot(&self.weight.t()) + &self.bias
    }
}

// =====================================================================================
// OBSERVATION FUSION PIPELINE
// =====================================================================================

/// Configuration for the reference fusion encoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FusionEncoderConfig {
    /// Main point cloud contributes pooled xyz features.
    pub use_point_cloud: bool,
    /// Wrist point cloud contributes pooled xyz features.
    pub use_wrist_point_cloud: bool,
    /// Proprioceptive state width; 0 disables the modality.
    pub state_dim: usize,
    /// Fused image channel count after the depth policy; 0 disables.
    pub image_channels: usize,
    /// Wrist image channel count; 0 disables.
    pub wrist_image_channels: usize,
    /// Per-step output feature width.
    pub feature_dim: usize,
}

impl Default for FusionEncoderConfig {
    fn default() -> Self {
        Self {
            use_point_cloud: true,
            use_wrist_point_cloud: false,
            state_dim: 20,
            image_channels: 0,
            wrist_image_channels: 0,
            feature_dim: 64,
        }
    }
}

impl FusionEncoderConfig {
    /// Raw pooled feature width per timestep, before projection.
    #[must_use]
    pub fn raw_step_dim(&self) -> usize {
        let mut dim = self.state_dim + self.image_channels + self.wrist_image_channels;
        if self.use_point_cloud {
            dim += 3;
        }
        if self.use_wrist_point_cloud {
            dim += 3;
        }
        dim
    }

    fn validate(&self) -> Result<()> {
        if self.feature_dim == 0 {
            return Err(KinetraError::Configuration(
                "fusion encoder feature_dim must be positive".into(),
            ));
        }
        if self.raw_step_dim() == 0 {
            return Err(KinetraError::Configuration(
                "fusion encoder has no enabled modalities".into(),
            ));
        }
        Ok(())
    }
}

/// Reference observation encoder: per-modality pooling plus a learned
/// per-step projection to the feature width.
///
/// Point clouds and images are pooled over their spatial extent so the
/// projection weights stay fixed-size regardless of point count or
/// resolution. Weights live in the checkpoint bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionEncoder {
    config: FusionEncoderConfig,
    projection: LinearLayer,
    output_shape: Vec<usize>,
}

impl FusionEncoder {
    /// Creates an encoder with seeded weights.
    pub fn seeded(config: FusionEncoderConfig, seed: u64) -> Result<Self> {
        use rand::SeedableRng;
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let projection = LinearLayer::seeded(&mut rng, config.raw_step_dim(), config.feature_dim);
        let output_shape = vec![config.feature_dim];
        Ok(Self {
            config,
            projection,
            output_shape,
        })
    }

    /// Encoder configuration.
    #[must_use]
    pub fn config(&self) -> &FusionEncoderConfig {
        &self.config
    }

    fn pool_cloud(name: &str, cloud: &Array4<f32>) -> Result<Array3<f32>> {
        cloud.mean_axis(Axis(2)).ok_or_else(|| {
            KinetraError::Configuration(format!("{name} has an empty point axis"))
        })
    }

    fn pool_image(name: &str, image: &Array5<f32>) -> Result<Array3<f32>> {
        image
            .mean_axis(Axis(4))
            .and_then(|a| a.mean_axis(Axis(3)))
            .ok_or_else(|| {
                KinetraError::Configuration(format!("{name} has an empty spatial axis"))
            })
    }

    fn pooled_features(&self, obs: &ObservationBatch) -> Result<Array3<f32>> {
        let (b, t) = obs.leading_dims()?;
        let mut parts: Vec<Array3<f32>> = Vec::new();

        if self.config.use_point_cloud {
            let pc = obs.point_cloud.as_ref().ok_or_else(|| {
                KinetraError::Configuration("encoder expects point_cloud modality".into())
            })?;
            parts.push(Self::pool_cloud("point_cloud", pc)?);
        }
        if self.config.use_wrist_point_cloud {
            let pc = obs.wrist_point_cloud.as_ref().ok_or_else(|| {
                KinetraError::Configuration("encoder expects wrist_point_cloud modality".into())
            })?;
            parts.push(Self::pool_cloud("wrist_point_cloud", pc)?);
        }
        if self.config.state_dim > 0 {
            let state = obs.agent_pos.as_ref().ok_or_else(|| {
                KinetraError::Configuration("encoder expects agent_pos modality".into())
            })?;
            if state.shape()[2] != self.config.state_dim {
                return Err(KinetraError::Configuration(format!(
                    "agent_pos width {} does not match encoder state_dim {}",
                    state.shape()[2],
                    self.config.state_dim
                )));
            }
            parts.push(state.clone());
        }
        if self.config.image_channels > 0 {
            let image = obs.image.as_ref().ok_or_else(|| {
                KinetraError::Configuration("encoder expects image modality".into())
            })?;
            if image.shape()[2] != self.config.image_channels {
                return Err(KinetraError::Configuration(format!(
                    "image channel count {} does not match encoder {}",
                    image.shape()[2],
                    self.config.image_channels
                )));
            }
            parts.push(Self::pool_image("image", image)?);
        }
        if self.config.wrist_image_channels > 0 {
            let image = obs.wrist_image.as_ref().ok_or_else(|| {
                KinetraError::Configuration("encoder expects wrist_image modality".into())
            })?;
            if image.shape()[2] != self.config.wrist_image_channels {
                return Err(KinetraError::Configuration(format!(
                    "wrist_image channel count {} does not match encoder {}",
                    image.shape()[2],
                    self.config.wrist_image_channels
                )));
            }
            parts.push(Self::pool_image("wrist_image", image)?);
        }

        let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
        let raw = concatenate(Axis(2), &views).map_err(|e| shape_err("pooled features", e))?;
        debug_assert_eq!(raw.dim(), (b, t, self.config.raw_step_dim()));
        Ok(raw)
    }
}

impl ObservationEncoder for FusionEncoder {
    fn encode(&self, obs: &ObservationBatch) -> Result<Array3<f32>> {
        let start = Instant::now();
        let raw = self.pooled_features(obs)?;
        let (b, t, d) = raw.dim();
        let rows = raw
            .into_shape_with_order((b * t, d))
            .map_err(|e| shape_err("feature rows", e))?;
        let projected = self.projection.forward_batch(&rows);
        let out = projected
            .into_shape_with_order((b, t, self.config.feature_dim))
            .map_err(|e| shape_err("feature output", e))?;
        histogram!("encoder_encode_ns").record(start.elapsed().as_nanos() as f64);
        counter!("encoder_total_encodings").increment(1);
        Ok(out)
    }

    fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }
}

/// Image/depth/wrist fusion policy applied before encoding.
///
/// Handles the hand-normalization the field normalizer does not: `1/255`
/// image scaling, trailing-channel layout detection (a 3-wide trailing axis
/// is permuted to channel-first), and the depth channel policy.
#[derive(Debug, Clone, Copy)]
pub struct FusionPipeline {
    profile: ObservationProfile,
}

impl FusionPipeline {
    /// Creates a pipeline for a resolved modality profile.
    #[must_use]
    pub fn new(profile: ObservationProfile) -> Self {
        Self { profile }
    }

    fn normalize_image(image: &Array5<f32>) -> Array5<f32> {
        let scaled = image.mapv(|v| v / 255.0);
        // Channel-last layout is detected only by a 3-wide trailing axis.
        if scaled.shape()[4] == 3 {
            scaled
                .permuted_axes([0, 1, 4, 2, 3])
                .as_standard_layout()
                .to_owned()
        } else {
            scaled
        }
    }

    /// Applies image scaling, layout normalization, and the depth policy.
    pub fn fuse(&self, batch: &ObservationBatch) -> Result<ObservationBatch> {
        let mut out = batch.clone();

        if let Some(image) = &batch.image {
            out.image = Some(Self::normalize_image(image));
        }
        if self.profile.use_wrist {
            if let Some(wrist) = &batch.wrist_image {
                out.wrist_image = Some(Self::normalize_image(wrist));
            }
        }

        if self.profile.use_depth {
            let depth = out.depth.as_ref().ok_or_else(|| {
                KinetraError::Configuration("depth fusion enabled but depth modality absent".into())
            })?;
            let depth5 = depth.clone().insert_axis(Axis(2));
            if self.profile.use_depth_only {
                out.image = Some(depth5);
            } else {
                let image = out.image.as_ref().ok_or_else(|| {
                    KinetraError::Configuration(
                        "depth concatenation requires an image modality".into(),
                    )
                })?;
                let fused = concatenate(Axis(2), &[image.view(), depth5.view()])
                    .map_err(|e| shape_err("depth fusion", e))?;
                out.image = Some(fused);
            }
        }
        Ok(out)
    }
}

// =====================================================================================
// CONDITIONING MASK GENERATION
// =====================================================================================

/// Produces the boolean conditioning mask over a trajectory tensor.
///
/// `true` marks positions whose values are copied from the condition tensor
/// at every denoising step; `false` positions are refined by the network.
/// With global conditioning the action segment carries no external values and
/// the mask is all-`false`; in inpainting mode the observation-feature suffix
/// of the first `n_obs_steps` rows is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrajectoryMaskGenerator {
    action_dim: usize,
    obs_feature_dim: usize,
    n_obs_steps: usize,
}

impl TrajectoryMaskGenerator {
    /// Creates a generator; `obs_feature_dim == 0` selects global-cond mode.
    #[must_use]
    pub fn new(action_dim: usize, obs_feature_dim: usize, n_obs_steps: usize) -> Self {
        Self {
            action_dim,
            obs_feature_dim,
            n_obs_steps,
        }
    }

    /// Whether the generator operates in inpainting mode.
    #[must_use]
    pub fn inpainting(&self) -> bool {
        self.obs_feature_dim > 0
    }

    /// Generates the mask for a `[B, T, D]` trajectory shape.
    pub fn generate(&self, dim: (usize, usize, usize)) -> Result<Array3<bool>> {
        let (b, t, d) = dim;
        let expected = self.action_dim + self.obs_feature_dim;
        if d != expected {
            return Err(KinetraError::Configuration(format!(
                "trajectory width {d} does not match action_dim {} + obs_feature_dim {}",
                self.action_dim, self.obs_feature_dim
            )));
        }
        if b == 0 || t == 0 || d == 0 {
            return Err(KinetraError::Configuration(format!(
                "degenerate trajectory shape {dim:?}"
            )));
        }
        let mut mask = Array3::from_elem(dim, false);
        if self.inpainting() {
            let to = self.n_obs_steps.min(t);
            mask.slice_mut(s![.., ..to, self.action_dim..]).fill(true);
        }
        if mask.iter().all(|&m| m) {
            return Err(KinetraError::Configuration(
                "conditioning mask fixes every trajectory element; nothing left to denoise".into(),
            ));
        }
        Ok(mask)
    }
}

/// Overwrites masked trajectory positions with the condition tensor's values.
///
/// The sampler exclusively owns the trajectory buffer across its loop; this
/// mutates it in place by contract.
pub fn apply_condition(
    trajectory: &mut Array3<f32>,
    mask: &Array3<bool>,
    condition_data: &Array3<f32>,
) -> Result<()> {
    if trajectory.dim() != mask.dim() || trajectory.dim() != condition_data.dim() {
        return Err(KinetraError::Configuration(format!(
            "condition shapes disagree: trajectory {:?}, mask {:?}, data {:?}",
            trajectory.dim(),
            mask.dim(),
            condition_data.dim()
        )));
    }
    ndarray::Zip::from(trajectory)
        .and(mask)
        .and(condition_data)
        .for_each(|t, &m, &c| {
            if m {
                *t = c;
            }
        });
    Ok(())
}

// =====================================================================================
// DDPM NOISE SCHEDULE
// =====================================================================================

/// Shape of the noise-variance curve over training timesteps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    /// Linear interpolation between `beta_start` and `beta_end`.
    Linear,
    /// Squared-cosine schedule with the standard 0.008 offset.
    SquaredCosine,
}

/// What the denoising network's output estimates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    /// The network predicts the added noise residual.
    Epsilon,
    /// The network predicts the clean sample directly.
    Sample,
}

/// Configuration of the diffusion noise schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DdpmScheduleConfig {
    /// Number of timesteps the model was trained with.
    pub num_train_timesteps: usize,
    /// First beta value (linear schedule).
    pub beta_start: f32,
    /// Last beta value (linear schedule).
    pub beta_end: f32,
    /// Beta curve shape.
    pub beta_schedule: BetaSchedule,
    /// Network output interpretation.
    pub prediction_type: PredictionType,
    /// Clamp the predicted clean sample into the training range.
    pub clip_sample: bool,
    /// Symmetric clamp bound when `clip_sample` is set.
    pub clip_sample_range: f32,
}

impl Default for DdpmScheduleConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 100,
            beta_start: 0.0001,
            beta_end: 0.02,
            beta_schedule: BetaSchedule::SquaredCosine,
            prediction_type: PredictionType::Epsilon,
            clip_sample: true,
            clip_sample_range: 1.0,
        }
    }
}

/// Discrete DDPM schedule with a serving-time inference subsequence.
///
/// Holds the per-timestep noise coefficients and the descending list of
/// timesteps visited during sampling. The reverse update in [`Self::step`] is
/// a pure function of its inputs once a generator is supplied.
#[derive(Debug, Clone)]
pub struct DdpmSchedule {
    config: DdpmScheduleConfig,
    alphas_cumprod: Array1<f32>,
    inference_timesteps: Vec<usize>,
    stride: usize,
}

impl DdpmSchedule {
    /// Builds the schedule tables from a validated configuration.
    pub fn new(config: DdpmScheduleConfig) -> Result<Self> {
        let n = config.num_train_timesteps;
        if n == 0 {
            return Err(KinetraError::Configuration(
                "num_train_timesteps must be positive".into(),
            ));
        }
        let betas = match config.beta_schedule {
            BetaSchedule::Linear => {
                if !(config.beta_start > 0.0 && config.beta_start <= config.beta_end
                    && config.beta_end < 1.0)
                {
                    return Err(KinetraError::Configuration(format!(
                        "invalid beta range [{}, {}]",
                        config.beta_start, config.beta_end
                    )));
                }
                Array1::linspace(config.beta_start, config.beta_end, n)
            }
            BetaSchedule::SquaredCosine => {
                let alpha_bar = |x: f32| ((x + 0.008) / 1.008 * PI / 2.0).cos().powi(2);
                (0..n)
                    .map(|t| {
                        let t1 = t as f32 / n as f32;
                        let t2 = (t + 1) as f32 / n as f32;
                        (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(0.999)
                    })
                    .collect::<Array1<f32>>()
            }
        };
        let alphas_cumprod = betas
            .iter()
            .scan(1.0_f32, |acc, &b| {
                *acc *= 1.0 - b;
                Some(*acc)
            })
            .collect::<Array1<f32>>();
        let inference_timesteps: Vec<usize> = (0..n).rev().collect();
        Ok(Self {
            config,
            alphas_cumprod,
            inference_timesteps,
            stride: 1,
        })
    }

    /// Schedule configuration.
    #[must_use]
    pub fn config(&self) -> &DdpmScheduleConfig {
        &self.config
    }

    /// Selects the serving subsequence of `num_inference_steps` timesteps.
    ///
    /// The subsequence is a uniform stride over the training schedule,
    /// visited in descending order.
    pub fn set_inference_steps(&mut self, num_inference_steps: usize) -> Result<()> {
        let n = self.config.num_train_timesteps;
        if num_inference_steps == 0 || num_inference_steps > n {
            return Err(KinetraError::Configuration(format!(
                "num_inference_steps {num_inference_steps} out of range 1..={n}"
            )));
        }
        let stride = n / num_inference_steps;
        self.inference_timesteps = (0..num_inference_steps).map(|i| i * stride).rev().collect();
        self.stride = stride;
        Ok(())
    }

    /// The descending timesteps visited during sampling.
    #[must_use]
    pub fn inference_timesteps(&self) -> &[usize] {
        &self.inference_timesteps
    }

    /// Number of network evaluations a full sampling pass performs.
    #[must_use]
    pub fn num_inference_steps(&self) -> usize {
        self.inference_timesteps.len()
    }

    #[inline]
    fn previous_timestep(&self, timestep: usize) -> i64 {
        timestep as i64 - self.stride as i64
    }

    /// Posterior variance at a timestep.
    #[must_use]
    pub fn variance(&self, timestep: usize) -> f32 {
        let prev_t = self.previous_timestep(timestep);
        let alpha_prod_t = self.alphas_cumprod[timestep];
        let alpha_prod_prev = if prev_t >= 0 {
            self.alphas_cumprod[prev_t as usize]
        } else {
            1.0
        };
        let current_beta = 1.0 - alpha_prod_t / alpha_prod_prev;
        ((1.0 - alpha_prod_prev) / (1.0 - alpha_prod_t) * current_beta).max(1e-20)
    }

    /// One reverse-process update: `x_t -> x_{t-1}`.
    ///
    /// Algebraic in the model output, timestep, and current sample; the only
    /// randomness is the posterior variance noise, drawn from `rng` when
    /// supplied and from process entropy otherwise.
    pub fn step(
        &self,
        model_output: &Array3<f32>,
        timestep: usize,
        sample: &Array3<f32>,
        rng: Option<&mut StdRng>,
    ) -> Result<Array3<f32>> {
        if timestep >= self.config.num_train_timesteps {
            return Err(KinetraError::Configuration(format!(
                "timestep {timestep} outside schedule of {}",
                self.config.num_train_timesteps
            )));
        }
        if model_output.dim() != sample.dim() {
            return Err(KinetraError::inference(format!(
                "model output shape {:?} does not match sample shape {:?}",
                model_output.dim(),
                sample.dim()
            )));
        }

        let prev_t = self.previous_timestep(timestep);
        let alpha_prod_t = self.alphas_cumprod[timestep];
        let alpha_prod_prev = if prev_t >= 0 {
            self.alphas_cumprod[prev_t as usize]
        } else {
            1.0
        };
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_prev = 1.0 - alpha_prod_prev;
        let current_alpha = alpha_prod_t / alpha_prod_prev;
        let current_beta = 1.0 - current_alpha;

        let mut pred_original = match self.config.prediction_type {
            PredictionType::Epsilon => {
                let scaled = model_output * beta_prod_t.sqrt();
                (sample - &scaled) / alpha_prod_t.sqrt()
            }
            PredictionType::Sample => model_output.clone(),
        };
        if self.config.clip_sample {
            let bound = self.config.clip_sample_range;
            pred_original.mapv_inplace(|v| v.clamp(-bound, bound));
        }

        let original_coeff = (alpha_prod_prev.sqrt() * current_beta) / beta_prod_t;
        let sample_coeff = (current_alpha.sqrt() * beta_prod_prev) / beta_prod_t;
        let mut prev_sample = &pred_original * original_coeff + sample * sample_coeff;

        if timestep > 0 {
            let sigma = self.variance(timestep).sqrt();
            let noise = sample_standard_normal(prev_sample.dim(), rng);
            prev_sample = prev_sample + noise * sigma;
        }
        Ok(prev_sample)
    }

    /// Forward-process noising: `x_0 -> x_t`.
    #[must_use]
    pub fn add_noise(
        &self,
        sample: &Array3<f32>,
        noise: &Array3<f32>,
        timestep: usize,
    ) -> Array3<f32> {
        let alpha_prod = self.alphas_cumprod[timestep];
        sample * alpha_prod.sqrt() + noise * (1.0 - alpha_prod).sqrt()
    }
}

/// Draws an independent standard-normal tensor.
///
/// With a generator the draw is fully deterministic; without, process entropy
/// is used.
#[must_use]
pub fn sample_standard_normal(
    dim: (usize, usize, usize),
    rng: Option<&mut StdRng>,
) -> Array3<f32> {
    match rng {
        Some(r) => Array3::from_shape_simple_fn(dim, || r.sample::<f32, _>(StandardNormal)),
        None => {
            let mut r = rand::rng();
            Array3::from_shape_simple_fn(dim, || r.sample::<f32, _>(StandardNormal))
        }
    }
}

// =====================================================================================
// CONDITIONAL DIFFUSION SAMPLER
// =====================================================================================

/// The reverse-diffusion refinement loop.
///
/// Owns a single mutable trajectory buffer for the duration of one sampling
/// pass. Conditioning is enforced at every iteration, not only at the end:
/// the network's output at masked positions is undefined and must never leak
/// into the returned trajectory. The timestep loop is strictly sequential;
/// each step's output is the next step's input.
pub struct ConditionalSampler<'a> {
    schedule: &'a DdpmSchedule,
    network: &'a dyn DenoiseNetwork,
}

impl<'a> ConditionalSampler<'a> {
    /// Creates a sampler over a schedule and a denoising network.
    #[must_use]
    pub fn new(schedule: &'a DdpmSchedule, network: &'a dyn DenoiseNetwork) -> Self {
        Self { schedule, network }
    }

    /// Runs the full refinement loop and returns the denoised trajectory.
    ///
    /// The trajectory is initialized from standard-normal noise with
    /// `condition_data`'s shape. Network evaluation errors propagate uncaught;
    /// a corrupted inference must not silently turn into a stale action.
    pub fn sample(
        &self,
        condition_data: &Array3<f32>,
        condition_mask: &Array3<bool>,
        global_cond: Option<&Array2<f32>>,
        mut rng: Option<&mut StdRng>,
    ) -> Result<Array3<f32>> {
        if condition_data.dim() != condition_mask.dim() {
            return Err(KinetraError::Configuration(format!(
                "condition data {:?} and mask {:?} shapes disagree",
                condition_data.dim(),
                condition_mask.dim()
            )));
        }

        let start = Instant::now();
        let mut trajectory = sample_standard_normal(condition_data.dim(), rng.as_deref_mut());

        for &t in self.schedule.inference_timesteps() {
            apply_condition(&mut trajectory, condition_mask, condition_data)?;
            let model_output = self.network.forward(&trajectory, t, global_cond)?;
            counter!("sampler_network_evaluations").increment(1);
            trajectory = self
                .schedule
                .step(&model_output, t, &trajectory, rng.as_deref_mut())?;
        }

        // Numerically edge-case steps can perturb fixed positions; enforce once more.
        apply_condition(&mut trajectory, condition_mask, condition_data)?;

        histogram!("sampler_pass_ns").record(start.elapsed().as_nanos() as f64);
        Ok(trajectory)
    }
}

// =====================================================================================
// REFERENCE DENOISING NETWORK
// =====================================================================================

/// Configuration for the reference MLP denoiser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MlpDenoiserConfig {
    /// Trajectory feature width the network consumes and produces.
    pub input_dim: usize,
    /// Global conditioning width; 0 disables conditioning.
    pub global_cond_dim: usize,
    /// Hidden layer width.
    pub hidden_dim: usize,
    /// Sinusoidal timestep embedding width (even).
    pub time_embed_dim: usize,
}

impl Default for MlpDenoiserConfig {
    fn default() -> Self {
        Self {
            input_dim: 20,
            global_cond_dim: 128,
            hidden_dim: 256,
            time_embed_dim: 64,
        }
    }
}

impl MlpDenoiserConfig {
    fn validate(&self) -> Result<()> {
        if self.input_dim == 0 || self.hidden_dim == 0 || self.time_embed_dim == 0 {
            return Err(KinetraError::Configuration(
                "denoiser dimensions must be positive".into(),
            ));
        }
        if self.time_embed_dim % 2 != 0 {
            return Err(KinetraError::Configuration(
                "time_embed_dim must be even".into(),
            ));
        }
        Ok(())
    }
}

/// Reference denoising network: timestep-embedded MLP with additive global
/// conditioning.
///
/// Stands in for the deployed score network behind the [`DenoiseNetwork`]
/// boundary; weights are seeded or loaded from a checkpoint bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlpDenoiser {
    config: MlpDenoiserConfig,
    time_proj: LinearLayer,
    cond_proj: Option<LinearLayer>,
    in_proj: LinearLayer,
    mid: LinearLayer,
    out_proj: LinearLayer,
}

impl MlpDenoiser {
    /// Creates a denoiser with seeded weights.
    pub fn seeded(config: MlpDenoiserConfig, seed: u64) -> Result<Self> {
        use rand::SeedableRng;
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let time_proj = LinearLayer::seeded(&mut rng, config.time_embed_dim, config.hidden_dim);
        let cond_proj = if config.global_cond_dim > 0 {
            Some(LinearLayer::seeded(
                &mut rng,
                config.global_cond_dim,
                config.hidden_dim,
            ))
        } else {
            None
        };
        let in_proj = LinearLayer::seeded(&mut rng, config.input_dim, config.hidden_dim);
        let mid = LinearLayer::seeded(&mut rng, config.hidden_dim, config.hidden_dim);
        let out_proj = LinearLayer::seeded(&mut rng, config.hidden_dim, config.input_dim);
        Ok(Self {
            config,
            time_proj,
            cond_proj,
            in_proj,
            mid,
            out_proj,
        })
    }

    /// Denoiser configuration.
    #[must_use]
    pub fn config(&self) -> &MlpDenoiserConfig {
        &self.config
    }
}

impl DenoiseNetwork for MlpDenoiser {
    fn forward(
        &self,
        trajectory: &Array3<f32>,
        timestep: usize,
        global_cond: Option<&Array2<f32>>,
    ) -> Result<Array3<f32>> {
        let (b, t, d) = trajectory.dim();
        if d != self.config.input_dim {
            return Err(KinetraError::inference(format!(
                "trajectory width {d} does not match denoiser input_dim {}",
                self.config.input_dim
            )));
        }

        let rows = trajectory
            .to_owned()
            .into_shape_with_order((b * t, d))
            .map_err(|e| shape_err("trajectory rows", e))?;
        let mut hidden = self.in_proj.forward_batch(&rows);

        let time_feat = self
            .time_proj
            .forward(&timestep_embedding(timestep, self.config.time_embed_dim));
        hidden += &time_feat;

        match (&self.cond_proj, global_cond) {
            (Some(proj), Some(cond)) => {
                if cond.dim() != (b, self.config.global_cond_dim) {
                    return Err(KinetraError::inference(format!(
                        "global_cond shape {:?} does not match ({b}, {})",
                        cond.dim(),
                        self.config.global_cond_dim
                    )));
                }
                let cond_feat = proj.forward_batch(cond);
                for (bi, mut chunk) in hidden.axis_chunks_iter_mut(Axis(0), t).enumerate() {
                    chunk += &cond_feat.row(bi);
                }
            }
            (Some(_), None) => {
                return Err(KinetraError::inference(
                    "denoiser expects a global conditioning vector",
                ));
            }
            (None, Some(_)) => {
                return Err(KinetraError::inference(
                    "denoiser was built without conditioning but received a vector",
                ));
            }
            (None, None) => {}
        }

        hidden.mapv_inplace(gelu);
        let mut mid = self.mid.forward_batch(&hidden);
        mid.mapv_inplace(gelu);
        let out = self.out_proj.forward_batch(&mid);
        out.into_shape_with_order((b, t, d))
            .map_err(|e| shape_err("denoiser output", e))
    }
}

// =====================================================================================
// ACTION EXTRACTION
// =====================================================================================

/// Which slice of the predicted trajectory a consumer executes.
///
/// The two alignments are a protocol contract, not a default: training
/// evaluation aligns the window to the end of the observation horizon
/// (`start = n_obs_steps - 1`), while serving always executes from the first
/// predicted step (`start = 0`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionAlignment {
    /// Window starts at `n_obs_steps - 1`.
    ObservationBoundary,
    /// Window starts at 0.
    Immediate,
}

/// Slices the unnormalized prediction to the execution horizon.
pub fn extract_action(
    action_pred: &Array3<f32>,
    alignment: ActionAlignment,
    n_obs_steps: usize,
    n_action_steps: usize,
) -> Result<Array3<f32>> {
    let horizon = action_pred.shape()[1];
    let start = match alignment {
        ActionAlignment::ObservationBoundary => {
            if n_obs_steps == 0 {
                return Err(KinetraError::Configuration(
                    "observation-boundary alignment requires n_obs_steps >= 1".into(),
                ));
            }
            n_obs_steps - 1
        }
        ActionAlignment::Immediate => 0,
    };
    let end = start + n_action_steps;
    if end > horizon {
        return Err(KinetraError::Configuration(format!(
            "action window [{start}, {end}) exceeds horizon {horizon}"
        )));
    }
    Ok(action_pred.slice(s![.., start..end, ..]).to_owned())
}

// =====================================================================================
// DIFFUSION POLICY
// =====================================================================================

/// Full policy configuration resolved at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Raw action shape: 1-element for a single effector, 2-element for
    /// multiple hands (`hands x per-hand dim`).
    pub action_shape: Vec<usize>,
    /// Prediction horizon in steps.
    pub horizon: usize,
    /// Action steps returned per prediction call.
    pub n_action_steps: usize,
    /// Observation timesteps consumed per prediction.
    pub n_obs_steps: usize,
    /// Denoising iterations at serving time.
    pub num_inference_steps: usize,
    /// Condition through a global feature vector rather than inpainting.
    pub obs_as_global_cond: bool,
    /// Modality presence profile.
    pub profile: ObservationProfile,
    /// Noise schedule configuration.
    pub schedule: DdpmScheduleConfig,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            action_shape: vec![20],
            horizon: 16,
            n_action_steps: 8,
            n_obs_steps: 2,
            num_inference_steps: 10,
            obs_as_global_cond: true,
            profile: ObservationProfile::default(),
            schedule: DdpmScheduleConfig::default(),
        }
    }
}

impl PolicyConfig {
    /// Flattened action dimensionality.
    pub fn action_dim(&self) -> Result<usize> {
        match self.action_shape.as_slice() {
            [d] if *d > 0 => Ok(*d),
            [hands, per_hand] if *hands > 0 && *per_hand > 0 => Ok(hands * per_hand),
            other => Err(KinetraError::Configuration(format!(
                "unsupported action shape {other:?}"
            ))),
        }
    }

    /// Validates the configuration; fails fast before any weights load.
    pub fn validate(&self) -> Result<()> {
        self.action_dim()?;
        if self.horizon == 0 {
            return Err(KinetraError::Configuration("horizon must be positive".into()));
        }
        if self.n_obs_steps == 0 {
            return Err(KinetraError::Configuration(
                "n_obs_steps must be at least 1".into(),
            ));
        }
        if self.n_action_steps == 0 || self.n_action_steps > self.horizon {
            return Err(KinetraError::Configuration(format!(
                "n_action_steps {} out of range 1..={}",
                self.n_action_steps, self.horizon
            )));
        }
        if self.n_obs_steps - 1 + self.n_action_steps > self.horizon {
            return Err(KinetraError::Configuration(format!(
                "observation-aligned window {}..{} exceeds horizon {}",
                self.n_obs_steps - 1,
                self.n_obs_steps - 1 + self.n_action_steps,
                self.horizon
            )));
        }
        if self.num_inference_steps == 0
            || self.num_inference_steps > self.schedule.num_train_timesteps
        {
            return Err(KinetraError::Configuration(format!(
                "num_inference_steps {} out of range 1..={}",
                self.num_inference_steps, self.schedule.num_train_timesteps
            )));
        }
        Ok(())
    }
}

/// A serving-side action prediction.
#[derive(Debug, Clone)]
pub struct PredictedAction {
    /// The execution window, `[B, n_action_steps, action_dim]`.
    pub action: Array3<f32>,
    /// The full unnormalized prediction, `[B, horizon, action_dim]`.
    pub action_pred: Array3<f32>,
}

/// The serving diffusion policy: normalize → fuse → sample → unnormalize →
/// extract.
///
/// Weights and normalizer state are loaded once and read-only thereafter; all
/// per-request tensors are request-scoped.
pub struct DiffusionPolicy {
    config: PolicyConfig,
    ctx: ExecContext,
    action_dim: usize,
    obs_feature_dim: usize,
    fusion: FusionPipeline,
    mask_generator: TrajectoryMaskGenerator,
    schedule: DdpmSchedule,
    normalizer: LinearNormalizer,
    encoder: Box<dyn ObservationEncoder>,
    network: Box<dyn DenoiseNetwork>,
}

impl fmt::Debug for DiffusionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DiffusionPolicy(action_dim={}, horizon={}, n_obs_steps={}, inference_steps={}, device={})",
            self.action_dim,
            self.config.horizon,
            self.config.n_obs_steps,
            self.schedule.num_inference_steps(),
            self.ctx.device
        )
    }
}

impl DiffusionPolicy {
    /// Assembles a policy from its collaborators.
    pub fn new(
        config: PolicyConfig,
        normalizer: LinearNormalizer,
        encoder: Box<dyn ObservationEncoder>,
        network: Box<dyn DenoiseNetwork>,
        ctx: ExecContext,
    ) -> Result<Self> {
        config.validate()?;
        let action_dim = config.action_dim()?;
        let obs_feature_dim: usize = encoder.output_shape().iter().product();
        if obs_feature_dim == 0 {
            return Err(KinetraError::Configuration(
                "encoder declares an empty output shape".into(),
            ));
        }
        let mut schedule = DdpmSchedule::new(config.schedule.clone())?;
        schedule.set_inference_steps(config.num_inference_steps)?;
        let mask_generator = TrajectoryMaskGenerator::new(
            action_dim,
            if config.obs_as_global_cond {
                0
            } else {
                obs_feature_dim
            },
            config.n_obs_steps,
        );
        let fusion = FusionPipeline::new(config.profile);
        info!(
            action_dim,
            obs_feature_dim,
            horizon = config.horizon,
            inference_steps = schedule.num_inference_steps(),
            device = %ctx.device,
            "diffusion policy assembled"
        );
        Ok(Self {
            config,
            ctx,
            action_dim,
            obs_feature_dim,
            fusion,
            mask_generator,
            schedule,
            normalizer,
            encoder,
            network,
        })
    }

    /// Policy configuration.
    #[must_use]
    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Flattened action width.
    #[must_use]
    pub fn action_dim(&self) -> usize {
        self.action_dim
    }

    /// Execution context the policy was assembled for.
    #[must_use]
    pub fn exec_context(&self) -> ExecContext {
        self.ctx
    }

    /// Shared front half of both prediction paths: normalize, fuse, window,
    /// encode, and build the conditioning tensors.
    fn prepare(
        &self,
        obs: &ObservationBatch,
    ) -> Result<(Array3<f32>, Array3<bool>, Option<Array2<f32>>)> {
        let (b, t) = obs.leading_dims()?;
        let to = self.config.n_obs_steps;
        if t < to {
            return Err(KinetraError::Configuration(format!(
                "observation provides {t} timesteps, policy needs {to}"
            )));
        }

        let nobs = self.normalizer.normalize_batch(obs)?;
        let fused = self.fusion.fuse(&nobs)?;
        let window = fused.window(to)?;
        let features = self.encoder.encode(&window)?;
        if features.dim() != (b, to, self.obs_feature_dim) {
            return Err(KinetraError::Configuration(format!(
                "encoder produced {:?}, expected {:?}",
                features.dim(),
                (b, to, self.obs_feature_dim)
            )));
        }

        let horizon = self.config.horizon;
        if self.config.obs_as_global_cond {
            let global = features
                .into_shape_with_order((b, to * self.obs_feature_dim))
                .map_err(|e| shape_err("global conditioning", e))?;
            let cond_data = Array3::zeros((b, horizon, self.action_dim));
            let cond_mask = self.mask_generator.generate(cond_data.dim())?;
            Ok((cond_data, cond_mask, Some(global)))
        } else {
            let width = self.action_dim + self.obs_feature_dim;
            let mut cond_data = Array3::zeros((b, horizon, width));
            cond_data
                .slice_mut(s![.., ..to, self.action_dim..])
                .assign(&features);
            let cond_mask = self.mask_generator.generate(cond_data.dim())?;
            Ok((cond_data, cond_mask, None))
        }
    }

    /// Runs the sampler and unnormalizes the action prefix.
    fn sample_action_pred(
        &self,
        cond_data: &Array3<f32>,
        cond_mask: &Array3<bool>,
        global_cond: Option<&Array2<f32>>,
        rng: Option<&mut StdRng>,
    ) -> Result<Array3<f32>> {
        let sampler = ConditionalSampler::new(&self.schedule, self.network.as_ref());
        let nsample = sampler.sample(cond_data, cond_mask, global_cond, rng)?;
        // Drop any inpainting feature suffix, keeping the action prefix.
        let naction = nsample.slice(s![.., .., ..self.action_dim]).to_owned();
        let unnorm = self
            .normalizer
            .unnormalize("action", &naction.into_dyn())?;
        unnorm
            .into_dimensionality::<Ix3>()
            .map_err(|e| shape_err("action prediction", e))
    }

    /// Serving-path prediction; the action window starts at step 0.
    pub fn predict_action(
        &self,
        obs: &ObservationBatch,
        rng: Option<&mut StdRng>,
    ) -> Result<PredictedAction> {
        let start = Instant::now();
        let (cond_data, cond_mask, global_cond) = self.prepare(obs)?;
        let action_pred =
            self.sample_action_pred(&cond_data, &cond_mask, global_cond.as_ref(), rng)?;
        let action = extract_action(
            &action_pred,
            ActionAlignment::Immediate,
            self.config.n_obs_steps,
            self.config.n_action_steps,
        )?;
        histogram!("policy_predict_ns").record(start.elapsed().as_nanos() as f64);
        counter!("policy_predictions").increment(1);
        Ok(PredictedAction {
            action,
            action_pred,
        })
    }

    /// Training-evaluation prediction; the action window aligns to the end of
    /// the observation horizon.
    pub fn evaluate_action(
        &self,
        obs: &ObservationBatch,
        rng: Option<&mut StdRng>,
    ) -> Result<Array3<f32>> {
        let (cond_data, cond_mask, global_cond) = self.prepare(obs)?;
        let action_pred =
            self.sample_action_pred(&cond_data, &cond_mask, global_cond.as_ref(), rng)?;
        extract_action(
            &action_pred,
            ActionAlignment::ObservationBoundary,
            self.config.n_obs_steps,
            self.config.n_action_steps,
        )
    }
}

// =====================================================================================
// CHECKPOINT BUNDLE
// =====================================================================================

/// Magic prefix of a serialized policy bundle.
pub const BUNDLE_MAGIC: [u8; 4] = *b"KNTR";
/// Current bundle format version.
pub const BUNDLE_VERSION: u32 = 1;

/// Persisted policy state: configuration, normalizer statistics, and network
/// weights, loaded once at server startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyBundle {
    /// Policy configuration.
    pub config: PolicyConfig,
    /// Fitted normalizer state.
    pub normalizer: LinearNormalizer,
    /// Observation encoder weights.
    pub encoder: FusionEncoder,
    /// Denoising network weights.
    pub network: MlpDenoiser,
    /// Bundle creation time.
    pub created_at: DateTime<Utc>,
}

impl PolicyBundle {
    /// Builds a bundle with seeded weights and unit normalizer statistics.
    ///
    /// Used by benches and smoke paths where no trained checkpoint exists.
    pub fn seeded(
        config: PolicyConfig,
        encoder_config: FusionEncoderConfig,
        hidden_dim: usize,
        time_embed_dim: usize,
        seed: u64,
    ) -> Result<Self> {
        config.validate()?;
        let action_dim = config.action_dim()?;
        let feature_dim = encoder_config.feature_dim;
        let encoder = FusionEncoder::seeded(encoder_config.clone(), seed)?;
        let network_config = MlpDenoiserConfig {
            input_dim: if config.obs_as_global_cond {
                action_dim
            } else {
                action_dim + feature_dim
            },
            global_cond_dim: if config.obs_as_global_cond {
                config.n_obs_steps * feature_dim
            } else {
                0
            },
            hidden_dim,
            time_embed_dim,
        };
        let network = MlpDenoiser::seeded(network_config, seed.wrapping_add(1))?;

        let mut normalizer = LinearNormalizer::new();
        normalizer.insert("action", FieldNormalizer::unit(action_dim));
        if encoder_config.state_dim > 0 {
            normalizer.insert("agent_pos", FieldNormalizer::unit(encoder_config.state_dim));
        }
        if encoder_config.use_point_cloud {
            normalizer.insert("point_cloud", FieldNormalizer::Identity);
        }
        if encoder_config.use_wrist_point_cloud {
            normalizer.insert("wrist_point_cloud", FieldNormalizer::Identity);
        }

        Ok(Self {
            config,
            normalizer,
            encoder,
            network,
            created_at: Utc::now(),
        })
    }

    /// Serializes the bundle to `path` with a magic/version prefix.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let body = bincode::serialize(self).map_err(|e| KinetraError::Checkpoint {
            message: format!("failed to encode bundle: {e}"),
        })?;
        let mut bytes = Vec::with_capacity(body.len() + 8);
        bytes.extend_from_slice(&BUNDLE_MAGIC);
        bytes.extend_from_slice(&BUNDLE_VERSION.to_le_bytes());
        bytes.extend_from_slice(&body);
        std::fs::write(path.as_ref(), bytes)?;
        Ok(())
    }

    /// Loads and verifies a bundle from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        if bytes.len() < 8 || bytes[..4] != BUNDLE_MAGIC {
            return Err(KinetraError::Checkpoint {
                message: format!("{} is not a kinetra policy bundle", path.as_ref().display()),
            });
        }
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != BUNDLE_VERSION {
            return Err(KinetraError::Checkpoint {
                message: format!("incompatible bundle version {version}"),
            });
        }
        bincode::deserialize(&bytes[8..]).map_err(|e| KinetraError::Checkpoint {
            message: format!("failed to decode bundle: {e}"),
        })
    }

    /// Consumes the bundle into a serving policy.
    pub fn into_policy(self, ctx: ExecContext) -> Result<DiffusionPolicy> {
        DiffusionPolicy::new(
            self.config,
            self.normalizer,
            Box::new(self.encoder),
            Box::new(self.network),
            ctx,
        )
    }
}

// =====================================================================================
// PRODUCTION TESTING & VALIDATION
// =====================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn dyn3(a: &Array3<f32>) -> ArrayD<f32> {
        a.clone().into_dyn()
    }

    /// Denoiser stub that returns zeros and counts evaluations.
    struct CountingDenoiser {
        calls: AtomicUsize,
    }

    impl CountingDenoiser {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
        fn calls(&self) -> usize {
            self.calls.load(Ordering::Relaxed)
        }
    }

    impl DenoiseNetwork for CountingDenoiser {
        fn forward(
            &self,
            trajectory: &Array3<f32>,
            _timestep: usize,
            _global_cond: Option<&Array2<f32>>,
        ) -> Result<Array3<f32>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(Array3::zeros(trajectory.dim()))
        }
    }

    /// Denoiser stub that records the worst masked-position deviation seen at
    /// each evaluation.
    struct MaskProbeDenoiser {
        mask: Array3<bool>,
        cond: Array3<f32>,
        deviations: Mutex<Vec<f32>>,
    }

    impl DenoiseNetwork for MaskProbeDenoiser {
        fn forward(
            &self,
            trajectory: &Array3<f32>,
            _timestep: usize,
            _global_cond: Option<&Array2<f32>>,
        ) -> Result<Array3<f32>> {
            let mut worst = 0.0f32;
            ndarray::Zip::from(trajectory)
                .and(&self.mask)
                .and(&self.cond)
                .for_each(|&t, &m, &c| {
                    if m {
                        worst = worst.max((t - c).abs());
                    }
                });
            self.deviations.lock().unwrap().push(worst);
            // Junk output everywhere, including masked positions: the sampler
            // must keep those pinned regardless.
            Ok(Array3::from_elem(trajectory.dim(), 7.5))
        }
    }

    fn affine_normalizer(dim: usize) -> LinearNormalizer {
        let mut n = LinearNormalizer::new();
        let min = Array1::from_elem(dim, -5.0);
        let max = Array1::from_elem(dim, 5.0);
        n.insert("action", FieldNormalizer::fit_range(&min, &max));
        n
    }

    #[test]
    fn normalizer_roundtrip_is_exact() {
        let n = affine_normalizer(4);
        let x = Array3::from_shape_fn((2, 3, 4), |(b, t, d)| {
            (b as f32) - (t as f32) * 0.5 + (d as f32) * 0.25
        });
        let normalized = n.normalize("action", &dyn3(&x)).unwrap();
        let restored = n.unnormalize("action", &normalized).unwrap();
        for (a, b) in x.iter().zip(restored.iter()) {
            assert!((a - b).abs() < 1e-5, "{a} vs {b}");
        }
    }

    #[test]
    fn normalizer_maps_limits_to_unit_range() {
        let min = Array1::from_vec(vec![-2.0, 0.0]);
        let max = Array1::from_vec(vec![2.0, 10.0]);
        let norm = FieldNormalizer::fit_range(&min, &max);
        let x = ndarray::arr2(&[[-2.0, 0.0], [2.0, 10.0]]).into_dyn();
        let n = norm.apply(&x, true).unwrap();
        assert!((n[[0, 0]] + 1.0).abs() < 1e-6);
        assert!((n[[0, 1]] + 1.0).abs() < 1e-6);
        assert!((n[[1, 0]] - 1.0).abs() < 1e-6);
        assert!((n[[1, 1]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn normalizer_missing_field_is_configuration_error() {
        let n = LinearNormalizer::new();
        let x = Array3::<f32>::zeros((1, 1, 3)).into_dyn();
        let err = n.normalize("action", &x).unwrap_err();
        assert!(matches!(err, KinetraError::Configuration(_)));
    }

    #[test]
    fn normalizer_identity_passthrough() {
        let mut n = LinearNormalizer::new();
        n.insert("point_cloud", FieldNormalizer::Identity);
        let x = Array4::from_elem((1, 2, 8, 3), 3.75f32).into_dyn();
        let out = n.normalize("point_cloud", &x).unwrap();
        assert_eq!(out, x);
    }

    #[test]
    fn normalizer_batch_skips_unrecognized_fields() {
        let mut n = LinearNormalizer::new();
        n.insert("agent_pos", FieldNormalizer::unit(4));
        let batch = ObservationBatch {
            agent_pos: Some(Array3::from_elem((1, 2, 4), 2.0)),
            image: Some(Array5::from_elem((1, 2, 3, 4, 4), 128.0)),
            ..Default::default()
        };
        let out = n.normalize_batch(&batch).unwrap();
        // Image is not the normalizer's concern; it must pass through raw.
        assert_eq!(out.image.unwrap()[[0, 0, 0, 0, 0]], 128.0);
        assert_eq!(out.agent_pos.unwrap()[[0, 0, 0]], 2.0);
    }

    #[test]
    fn degenerate_range_falls_back_to_identity_scale() {
        let min = Array1::from_vec(vec![1.0]);
        let max = Array1::from_vec(vec![1.0]);
        let norm = FieldNormalizer::fit_range(&min, &max);
        let x = ndarray::arr1(&[1.0]).into_dyn();
        let n = norm.apply(&x, true).unwrap();
        let back = norm.apply(&n, false).unwrap();
        assert!((back[[0]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn mask_is_all_false_for_global_conditioning() {
        let gen = TrajectoryMaskGenerator::new(6, 0, 2);
        let mask = gen.generate((2, 8, 6)).unwrap();
        assert!(mask.iter().all(|&m| !m));
    }

    #[test]
    fn mask_marks_observation_feature_suffix_when_inpainting() {
        let gen = TrajectoryMaskGenerator::new(4, 3, 2);
        let mask = gen.generate((1, 8, 7)).unwrap();
        for t in 0..8 {
            for d in 0..7 {
                let expected = t < 2 && d >= 4;
                assert_eq!(mask[[0, t, d]], expected, "position ({t}, {d})");
            }
        }
    }

    #[test]
    fn all_masked_trajectory_is_rejected() {
        let gen = TrajectoryMaskGenerator::new(0, 3, 4);
        let err = gen.generate((1, 2, 3)).unwrap_err();
        assert!(matches!(err, KinetraError::Configuration(_)));
    }

    #[test]
    fn mask_width_mismatch_is_rejected() {
        let gen = TrajectoryMaskGenerator::new(4, 0, 2);
        assert!(gen.generate((1, 8, 5)).is_err());
    }

    #[test]
    fn apply_condition_overwrites_only_masked_positions() {
        let mut traj = Array3::from_elem((1, 2, 2), 9.0);
        let mut mask = Array3::from_elem((1, 2, 2), false);
        mask[[0, 0, 1]] = true;
        let cond = Array3::from_elem((1, 2, 2), -3.0);
        apply_condition(&mut traj, &mask, &cond).unwrap();
        assert_eq!(traj[[0, 0, 1]], -3.0);
        assert_eq!(traj[[0, 0, 0]], 9.0);
        assert_eq!(traj[[0, 1, 0]], 9.0);
    }

    #[test]
    fn apply_condition_rejects_shape_mismatch() {
        let mut traj = Array3::<f32>::zeros((1, 2, 2));
        let mask = Array3::from_elem((1, 2, 3), false);
        let cond = Array3::<f32>::zeros((1, 2, 2));
        assert!(apply_condition(&mut traj, &mask, &cond).is_err());
    }

    #[test]
    fn schedule_timesteps_are_strided_and_descending() {
        let mut schedule = DdpmSchedule::new(DdpmScheduleConfig {
            num_train_timesteps: 100,
            ..Default::default()
        })
        .unwrap();
        schedule.set_inference_steps(10).unwrap();
        let ts = schedule.inference_timesteps();
        assert_eq!(ts.len(), 10);
        assert_eq!(ts[0], 90);
        assert_eq!(ts[9], 0);
        assert!(ts.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn schedule_rejects_oversized_inference_steps() {
        let mut schedule = DdpmSchedule::new(DdpmScheduleConfig::default()).unwrap();
        assert!(schedule.set_inference_steps(0).is_err());
        assert!(schedule.set_inference_steps(101).is_err());
    }

    #[test]
    fn linear_betas_are_monotonic() {
        let schedule = DdpmSchedule::new(DdpmScheduleConfig {
            beta_schedule: BetaSchedule::Linear,
            ..Default::default()
        })
        .unwrap();
        // Cumulative products must strictly decrease as noise accumulates.
        let acp = &schedule.alphas_cumprod;
        assert!(acp.windows(2).into_iter().all(|w| w[1] < w[0]));
        assert!(acp[0] < 1.0 && acp[acp.len() - 1] > 0.0);
    }

    #[test]
    fn cosine_schedule_stays_bounded() {
        let schedule = DdpmSchedule::new(DdpmScheduleConfig {
            beta_schedule: BetaSchedule::SquaredCosine,
            ..Default::default()
        })
        .unwrap();
        assert!(schedule
            .alphas_cumprod
            .iter()
            .all(|&a| a > 0.0 && a <= 1.0));
    }

    #[test]
    fn step_at_zero_is_deterministic_without_noise() {
        let schedule = DdpmSchedule::new(DdpmScheduleConfig::default()).unwrap();
        let sample = Array3::from_elem((1, 2, 3), 0.5);
        let output = Array3::from_elem((1, 2, 3), 0.1);
        let a = schedule.step(&output, 0, &sample, None).unwrap();
        let b = schedule.step(&output, 0, &sample, None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn step_rejects_out_of_schedule_timestep() {
        let schedule = DdpmSchedule::new(DdpmScheduleConfig::default()).unwrap();
        let sample = Array3::<f32>::zeros((1, 1, 1));
        assert!(schedule.step(&sample.clone(), 100, &sample, None).is_err());
    }

    #[test]
    fn add_noise_interpolates_with_schedule() {
        let schedule = DdpmSchedule::new(DdpmScheduleConfig::default()).unwrap();
        let clean = Array3::from_elem((1, 1, 2), 1.0);
        let noise = Array3::from_elem((1, 1, 2), 1.0);
        let noisy = schedule.add_noise(&clean, &noise, 50);
        let acp = schedule.alphas_cumprod[50];
        let expected = acp.sqrt() + (1.0 - acp).sqrt();
        assert!((noisy[[0, 0, 0]] - expected).abs() < 1e-6);
    }

    #[test]
    fn sampler_calls_network_exactly_num_inference_steps_times() {
        let mut schedule = DdpmSchedule::new(DdpmScheduleConfig::default()).unwrap();
        schedule.set_inference_steps(7).unwrap();
        let network = CountingDenoiser::new();
        let sampler = ConditionalSampler::new(&schedule, &network);
        let cond = Array3::<f32>::zeros((1, 4, 3));
        let mask = Array3::from_elem((1, 4, 3), false);
        let out = sampler.sample(&cond, &mask, None, None).unwrap();
        assert_eq!(network.calls(), 7);
        assert_eq!(out.dim(), cond.dim());
    }

    #[test]
    fn sampler_enforces_conditioning_at_every_step_and_on_output() {
        let mut schedule = DdpmSchedule::new(DdpmScheduleConfig::default()).unwrap();
        schedule.set_inference_steps(6).unwrap();

        let mut cond = Array3::<f32>::zeros((1, 4, 5));
        cond.slice_mut(s![.., ..2, 3..]).fill(0.42);
        let mut mask = Array3::from_elem((1, 4, 5), false);
        mask.slice_mut(s![.., ..2, 3..]).fill(true);

        let network = MaskProbeDenoiser {
            mask: mask.clone(),
            cond: cond.clone(),
            deviations: Mutex::new(Vec::new()),
        };
        let sampler = ConditionalSampler::new(&schedule, &network);
        let out = sampler.sample(&cond, &mask, None, None).unwrap();

        let deviations = network.deviations.lock().unwrap();
        assert_eq!(deviations.len(), 6);
        assert!(
            deviations.iter().all(|&d| d == 0.0),
            "masked positions drifted during sampling: {deviations:?}"
        );
        ndarray::Zip::from(&out).and(&mask).and(&cond).for_each(|&o, &m, &c| {
            if m {
                assert_eq!(o, c);
            }
        });
    }

    #[test]
    fn sampler_is_deterministic_under_a_seed() {
        let mut schedule = DdpmSchedule::new(DdpmScheduleConfig::default()).unwrap();
        schedule.set_inference_steps(5).unwrap();
        let network = MlpDenoiser::seeded(
            MlpDenoiserConfig {
                input_dim: 3,
                global_cond_dim: 0,
                hidden_dim: 16,
                time_embed_dim: 8,
            },
            11,
        )
        .unwrap();
        let sampler = ConditionalSampler::new(&schedule, &network);
        let cond = Array3::<f32>::zeros((2, 4, 3));
        let mask = Array3::from_elem((2, 4, 3), false);

        let mut rng_a = StdRng::seed_from_u64(99);
        let mut rng_b = StdRng::seed_from_u64(99);
        let a = sampler.sample(&cond, &mask, None, Some(&mut rng_a)).unwrap();
        let b = sampler.sample(&cond, &mask, None, Some(&mut rng_b)).unwrap();
        assert_eq!(a, b);

        let mut rng_c = StdRng::seed_from_u64(100);
        let c = sampler.sample(&cond, &mask, None, Some(&mut rng_c)).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn fusion_appends_depth_as_extra_channel() {
        let pipeline = FusionPipeline::new(ObservationProfile {
            use_wrist: false,
            use_depth: true,
            use_depth_only: false,
        });
        let batch = ObservationBatch {
            image: Some(Array5::from_elem((1, 2, 3, 4, 4), 255.0)),
            depth: Some(Array4::from_elem((1, 2, 4, 4), 0.5)),
            ..Default::default()
        };
        let fused = pipeline.fuse(&batch).unwrap();
        let image = fused.image.unwrap();
        assert_eq!(image.shape(), &[1, 2, 4, 4, 4]);
        assert!((image[[0, 0, 0, 0, 0]] - 1.0).abs() < 1e-6); // scaled rgb
        assert!((image[[0, 0, 3, 0, 0]] - 0.5).abs() < 1e-6); // appended depth
    }

    #[test]
    fn fusion_depth_only_replaces_image() {
        let pipeline = FusionPipeline::new(ObservationProfile {
            use_wrist: false,
            use_depth: true,
            use_depth_only: true,
        });
        let batch = ObservationBatch {
            image: Some(Array5::from_elem((1, 2, 3, 4, 4), 255.0)),
            depth: Some(Array4::from_elem((1, 2, 4, 4), 0.25)),
            ..Default::default()
        };
        let fused = pipeline.fuse(&batch).unwrap();
        let image = fused.image.unwrap();
        assert_eq!(image.shape(), &[1, 2, 1, 4, 4]);
        assert!((image[[0, 0, 0, 0, 0]] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn fusion_permutes_trailing_channel_layout() {
        let pipeline = FusionPipeline::new(ObservationProfile::default());
        let mut raw = Array5::<f32>::zeros((1, 2, 4, 5, 3));
        raw[[0, 1, 2, 3, 1]] = 255.0;
        let batch = ObservationBatch {
            image: Some(raw),
            ..Default::default()
        };
        let fused = pipeline.fuse(&batch).unwrap();
        let image = fused.image.unwrap();
        assert_eq!(image.shape(), &[1, 2, 3, 4, 5]);
        assert!((image[[0, 1, 1, 2, 3]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn fusion_channel_first_input_is_left_alone() {
        let pipeline = FusionPipeline::new(ObservationProfile::default());
        let batch = ObservationBatch {
            image: Some(Array5::from_elem((1, 2, 4, 6, 6), 51.0)),
            ..Default::default()
        };
        let fused = pipeline.fuse(&batch).unwrap();
        let image = fused.image.unwrap();
        assert_eq!(image.shape(), &[1, 2, 4, 6, 6]);
        assert!((image[[0, 0, 0, 0, 0]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn extraction_offsets_differ_by_observation_horizon() {
        let horizon = 16;
        let n_obs_steps = 3;
        let n_action_steps = 4;
        // Encode the step index into the tensor so slices are identifiable.
        let pred = Array3::from_shape_fn((1, horizon, 2), |(_, t, _)| t as f32);

        let training = extract_action(
            &pred,
            ActionAlignment::ObservationBoundary,
            n_obs_steps,
            n_action_steps,
        )
        .unwrap();
        let serving = extract_action(
            &pred,
            ActionAlignment::Immediate,
            n_obs_steps,
            n_action_steps,
        )
        .unwrap();

        assert_eq!(training[[0, 0, 0]], 2.0);
        assert_eq!(serving[[0, 0, 0]], 0.0);
        assert_eq!(
            training[[0, 0, 0]] as usize - serving[[0, 0, 0]] as usize,
            n_obs_steps - 1
        );
        assert_eq!(training.dim(), (1, n_action_steps, 2));
        assert_eq!(serving.dim(), (1, n_action_steps, 2));
    }

    #[test]
    fn extraction_rejects_window_past_horizon() {
        let pred = Array3::<f32>::zeros((1, 4, 2));
        assert!(extract_action(&pred, ActionAlignment::ObservationBoundary, 3, 3).is_err());
    }

    fn e2e_batch() -> ObservationBatch {
        ObservationBatch {
            point_cloud: Some(Array3::from_shape_fn((2, 4096, 3), |(t, n, c)| {
                ((t * 31 + n * 7 + c) % 17) as f32 * 0.1
            })
            .insert_axis(Axis(0))),
            agent_pos: Some(Array2::from_shape_fn((2, 20), |(t, d)| {
                (t as f32) * 0.5 + (d as f32) * 0.01
            })
            .insert_axis(Axis(0))),
            ..Default::default()
        }
    }

    fn e2e_config() -> PolicyConfig {
        PolicyConfig {
            action_shape: vec![20],
            horizon: 16,
            n_action_steps: 8,
            n_obs_steps: 2,
            num_inference_steps: 6,
            obs_as_global_cond: true,
            profile: ObservationProfile::default(),
            schedule: DdpmScheduleConfig::default(),
        }
    }

    #[test]
    fn end_to_end_prediction_matches_contract() {
        let config = e2e_config();
        let encoder = FusionEncoder::seeded(
            FusionEncoderConfig {
                use_point_cloud: true,
                use_wrist_point_cloud: false,
                state_dim: 20,
                image_channels: 0,
                wrist_image_channels: 0,
                feature_dim: 32,
            },
            3,
        )
        .unwrap();
        let network = std::sync::Arc::new(CountingDenoiser::new());
        let mut normalizer = LinearNormalizer::new();
        normalizer.insert("action", FieldNormalizer::unit(20));
        normalizer.insert("agent_pos", FieldNormalizer::unit(20));
        normalizer.insert("point_cloud", FieldNormalizer::Identity);

        // Count evaluations through a shared handle.
        struct Shared(std::sync::Arc<CountingDenoiser>);
        impl DenoiseNetwork for Shared {
            fn forward(
                &self,
                trajectory: &Array3<f32>,
                timestep: usize,
                global_cond: Option<&Array2<f32>>,
            ) -> Result<Array3<f32>> {
                self.0.forward(trajectory, timestep, global_cond)
            }
        }

        let policy = DiffusionPolicy::new(
            config,
            normalizer,
            Box::new(encoder),
            Box::new(Shared(network.clone())),
            ExecContext::default(),
        )
        .unwrap();

        let mut rng = StdRng::seed_from_u64(7);
        let result = policy.predict_action(&e2e_batch(), Some(&mut rng)).unwrap();

        assert_eq!(result.action.dim(), (1, 8, 20));
        assert_eq!(result.action_pred.dim(), (1, 16, 20));
        assert_eq!(network.calls(), 6);
        ensure_finite("action", &result.action).unwrap();
    }

    #[test]
    fn predict_and_evaluate_share_the_horizon_but_not_the_offset() {
        let mut config = e2e_config();
        config.n_obs_steps = 3;
        let bundle = PolicyBundle::seeded(
            config,
            FusionEncoderConfig {
                feature_dim: 16,
                ..Default::default()
            },
            64,
            16,
            21,
        )
        .unwrap();
        let policy = bundle.into_policy(ExecContext::default()).unwrap();

        let obs = ObservationBatch {
            point_cloud: Some(Array4::from_elem((1, 3, 256, 3), 0.2)),
            agent_pos: Some(Array3::from_elem((1, 3, 20), 0.1)),
            ..Default::default()
        };

        let mut rng_a = StdRng::seed_from_u64(5);
        let mut rng_b = StdRng::seed_from_u64(5);
        let serving = policy.predict_action(&obs, Some(&mut rng_a)).unwrap();
        let aligned = policy.evaluate_action(&obs, Some(&mut rng_b)).unwrap();

        // Identical sampling: the evaluation window is the serving prediction
        // shifted by n_obs_steps - 1.
        let shifted = serving
            .action_pred
            .slice(s![.., 2..10, ..])
            .to_owned();
        assert_eq!(aligned, shifted);
    }

    #[test]
    fn policy_rejects_short_observation_window() {
        let bundle = PolicyBundle::seeded(
            e2e_config(),
            FusionEncoderConfig {
                feature_dim: 16,
                ..Default::default()
            },
            32,
            16,
            1,
        )
        .unwrap();
        let policy = bundle.into_policy(ExecContext::default()).unwrap();
        let obs = ObservationBatch {
            point_cloud: Some(Array4::from_elem((1, 1, 64, 3), 0.0)),
            agent_pos: Some(Array3::from_elem((1, 1, 20), 0.0)),
            ..Default::default()
        };
        assert!(policy.predict_action(&obs, None).is_err());
    }

    #[test]
    fn policy_config_validation_fails_fast() {
        let mut config = PolicyConfig::default();
        config.n_action_steps = 99;
        assert!(config.validate().is_err());

        let mut config = PolicyConfig::default();
        config.action_shape = vec![];
        assert!(config.validate().is_err());

        let mut config = PolicyConfig::default();
        config.num_inference_steps = 101;
        assert!(config.validate().is_err());

        // Multi-hand action shapes flatten.
        let mut config = PolicyConfig::default();
        config.action_shape = vec![2, 12];
        assert_eq!(config.action_dim().unwrap(), 24);
    }

    #[test]
    fn resampler_produces_fixed_point_count() {
        let cloud = Array3::from_shape_fn((2, 100, 3), |(t, n, c)| {
            (t * 1000 + n * 3 + c) as f32
        });
        let resampler = UniformResampler::default();
        let down = resampler.resample(&cloud, 32).unwrap();
        assert_eq!(down.dim(), (2, 32, 3));
        let up = resampler.resample(&cloud, 200).unwrap();
        assert_eq!(up.dim(), (2, 200, 3));
        // Rows must come from the source set.
        let first = down.slice(s![0, 0, ..]);
        assert!(first[2usize] - first[1usize] == 1.0 && first[1usize] - first[0usize] == 1.0);
    }

    #[test]
    fn resampler_is_deterministic_per_seed() {
        let cloud = Array3::from_shape_fn((1, 50, 3), |(_, n, c)| (n * 3 + c) as f32);
        let a = UniformResampler { seed: 9 }.resample(&cloud, 16).unwrap();
        let b = UniformResampler { seed: 9 }.resample(&cloud, 16).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn bundle_roundtrip_preserves_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.kntr");

        let bundle = PolicyBundle::seeded(
            e2e_config(),
            FusionEncoderConfig {
                feature_dim: 16,
                ..Default::default()
            },
            64,
            16,
            77,
        )
        .unwrap();
        bundle.save(&path).unwrap();
        let restored = PolicyBundle::load(&path).unwrap();
        assert_eq!(restored.config, bundle.config);

        let policy_a = bundle.into_policy(ExecContext::default()).unwrap();
        let policy_b = restored.into_policy(ExecContext::default()).unwrap();
        let obs = e2e_batch();
        let mut rng_a = StdRng::seed_from_u64(3);
        let mut rng_b = StdRng::seed_from_u64(3);
        let a = policy_a.predict_action(&obs, Some(&mut rng_a)).unwrap();
        let b = policy_b.predict_action(&obs, Some(&mut rng_b)).unwrap();
        assert_eq!(a.action, b.action);
    }

    #[test]
    fn bundle_rejects_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_a_bundle.bin");
        std::fs::write(&path, b"XXXX0000garbage").unwrap();
        let err = PolicyBundle::load(&path).unwrap_err();
        assert!(matches!(err, KinetraError::Checkpoint { .. }));
    }

    #[test]
    fn ensure_finite_flags_nan() {
        let mut x = Array3::<f32>::zeros((1, 1, 2));
        ensure_finite("clean", &x).unwrap();
        x[[0, 0, 1]] = f32::NAN;
        assert!(matches!(
            ensure_finite("dirty", &x),
            Err(KinetraError::Inference { .. })
        ));
    }

    mod roundtrip_property {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn normalize_then_unnormalize_is_identity(
                values in proptest::collection::vec(-4.9f32..4.9, 12)
            ) {
                let n = affine_normalizer(4);
                let x = ArrayD::from_shape_vec(ndarray::IxDyn(&[1, 3, 4]), values).unwrap();
                let restored = n
                    .unnormalize("action", &n.normalize("action", &x).unwrap())
                    .unwrap();
                for (a, b) in x.iter().zip(restored.iter()) {
                    prop_assert!((a - b).abs() < 1e-5);
                }
            }
        }
    }
}
