/* src/servo_link.rs */
#![warn(missing_docs)]
//! # ServoLink: Request/Response Inference Serving
//!
//! Blocking-style request/response transport and the serving loop that drives
//! the diffusion policy: receive one observation payload, decode it through a
//! strict allow-list, predict, respond, repeat. Exactly one request is in
//! flight at any time; the policy and its weights are not reentrant and the
//! loop never pipelines.
//!
//! Frames are `u32` length-prefixed `bincode` messages over a single accepted
//! TCP connection. A lost client simply re-arms the accept loop; a malformed
//! request or a failed prediction produces an explicit error response for
//! that cycle — never a stale action.
//!
/*▫~•◦────────────────────────────────────────────────────────────────────────────────────‣
 * © 2025 ArcMoon Studios ◦ SPDX-License-Identifier MIT OR Apache-2.0 ◦ Author: Lord Xyn ✶
 *///◦────────────────────────────────────────────────────────────────────────────────────‣

use std::net::SocketAddr;
use std::time::Duration;

use hashbrown::HashMap as FastMap;
use ndarray::{Array2, Array3, Axis};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::kinetra_core::{
    ensure_finite, CloudResampler, DiffusionPolicy, KinetraError, ObservationBatch, Result,
};
use crate::timescope::TimeScope;

// =====================================================================================
// WIRE PAYLOADS
// =====================================================================================

/// Default bind address for the inference server.
pub const DEFAULT_HOST: &str = "0.0.0.0";
/// Default port for the inference server.
pub const DEFAULT_PORT: u16 = 18000;
/// Upper bound on a single frame; anything larger is a protocol violation.
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// A dense row-major tensor on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorPayload {
    /// Dimension sizes, outermost first.
    pub shape: Vec<usize>,
    /// Row-major element data.
    pub data: Vec<f32>,
}

impl TensorPayload {
    /// Creates a payload, verifying the element count matches the shape.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(KinetraError::transport(format!(
                "payload shape {shape:?} implies {expected} elements, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Builds a payload from a 2-d tensor.
    #[must_use]
    pub fn from_array2(array: &Array2<f32>) -> Self {
        Self {
            shape: array.shape().to_vec(),
            data: array.iter().copied().collect(),
        }
    }

    /// Builds a payload from a 3-d tensor.
    #[must_use]
    pub fn from_array3(array: &Array3<f32>) -> Self {
        Self {
            shape: array.shape().to_vec(),
            data: array.iter().copied().collect(),
        }
    }

    /// Reconstructs a 2-d tensor.
    pub fn to_array2(&self) -> Result<Array2<f32>> {
        let [a, b] = self.shape.as_slice() else {
            return Err(KinetraError::transport(format!(
                "expected a 2-d tensor, got shape {:?}",
                self.shape
            )));
        };
        Array2::from_shape_vec((*a, *b), self.data.clone())
            .map_err(|e| KinetraError::transport(format!("payload reshape failed: {e}")))
    }

    /// Reconstructs a 3-d tensor.
    pub fn to_array3(&self) -> Result<Array3<f32>> {
        let [a, b, c] = self.shape.as_slice() else {
            return Err(KinetraError::transport(format!(
                "expected a 3-d tensor, got shape {:?}",
                self.shape
            )));
        };
        Array3::from_shape_vec((*a, *b, *c), self.data.clone())
            .map_err(|e| KinetraError::transport(format!("payload reshape failed: {e}")))
    }
}

/// A modality-keyed observation request.
pub type PayloadMap = FastMap<String, TensorPayload>;

/// One serving-cycle response.
///
/// A failed cycle answers with an explicit error sentinel; the controller on
/// the far side must never execute a stale or undefined action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionResponse {
    /// A successful prediction: `[n_action_steps, action_dim]`.
    Action {
        /// The predicted execution window.
        action: TensorPayload,
    },
    /// The cycle failed; no action may be executed.
    Error {
        /// Human-readable failure description.
        message: String,
        /// Index of the failed request for log correlation.
        request_index: u64,
    },
}

// =====================================================================================
// FRAMED TRANSPORT
// =====================================================================================

async fn write_frame(stream: &mut TcpStream, bytes: &[u8]) -> Result<()> {
    let len = u32::try_from(bytes.len()).map_err(|_| {
        KinetraError::transport(format!("frame of {} bytes exceeds u32 length", bytes.len()))
    })?;
    if len > MAX_FRAME_BYTES {
        return Err(KinetraError::transport(format!(
            "frame of {len} bytes exceeds the {MAX_FRAME_BYTES} byte limit"
        )));
    }
    stream.write_all(&len.to_le_bytes()).await?;
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME_BYTES {
        return Err(KinetraError::transport(format!(
            "peer announced a {len} byte frame, limit is {MAX_FRAME_BYTES}"
        )));
    }
    let mut bytes = vec![0u8; len as usize];
    stream.read_exact(&mut bytes).await?;
    Ok(bytes)
}

/// Server side of the request/response pair.
///
/// One listener, one accepted client at a time. `recv_request` is the sole
/// suspension point between serving cycles.
#[derive(Debug)]
pub struct ResponseServer {
    listener: TcpListener,
    conn: Option<TcpStream>,
}

impl ResponseServer {
    /// Binds the listener.
    pub async fn bind(host: &str, port: u16) -> Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        info!(addr = %listener.local_addr()?, "response server listening");
        Ok(Self {
            listener,
            conn: None,
        })
    }

    /// The bound socket address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Blocks until one request payload arrives.
    ///
    /// A dropped client re-arms the accept loop transparently. A frame that
    /// arrives but fails to decode is a [`KinetraError::Transport`] returned
    /// with the connection intact, so the caller can answer with an error
    /// sentinel.
    pub async fn recv_request(&mut self) -> Result<PayloadMap> {
        loop {
            if self.conn.is_none() {
                let (stream, peer) = self.listener.accept().await?;
                info!(%peer, "client connected");
                self.conn = Some(stream);
            }
            let Some(stream) = self.conn.as_mut() else {
                continue;
            };
            match read_frame(stream).await {
                Ok(bytes) => {
                    return bincode::deserialize(&bytes).map_err(|e| {
                        KinetraError::transport(format!("undecodable request payload: {e}"))
                    });
                }
                Err(KinetraError::Io(e)) => {
                    info!(error = %e, "client connection closed, re-arming accept");
                    self.conn = None;
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Sends one response frame to the connected client.
    pub async fn send_response(&mut self, response: &ActionResponse) -> Result<()> {
        let stream = self
            .conn
            .as_mut()
            .ok_or_else(|| KinetraError::transport("no client connected"))?;
        let bytes = bincode::serialize(response)
            .map_err(|e| KinetraError::transport(format!("response encoding failed: {e}")))?;
        if let Err(e) = write_frame(stream, &bytes).await {
            self.conn = None;
            return Err(e);
        }
        Ok(())
    }
}

/// Client side of the request/response pair.
#[derive(Debug)]
pub struct ResponseClient {
    stream: TcpStream,
}

impl ResponseClient {
    /// Connects to a serving endpoint.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Self { stream })
    }

    /// Sends one observation payload and blocks for the response.
    pub async fn request(&mut self, payload: &PayloadMap) -> Result<ActionResponse> {
        let bytes = bincode::serialize(payload)
            .map_err(|e| KinetraError::transport(format!("request encoding failed: {e}")))?;
        write_frame(&mut self.stream, &bytes).await?;
        let reply = read_frame(&mut self.stream).await?;
        bincode::deserialize(&reply)
            .map_err(|e| KinetraError::transport(format!("undecodable response: {e}")))
    }
}

// =====================================================================================
// SERVING LOOP STATE MACHINE
// =====================================================================================

/// Serving loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServoLoopConfig {
    /// Fixed point count every received cloud is resampled to.
    pub target_points: usize,
    /// Reporting threshold for the per-cycle prediction scope.
    pub predict_threshold: Duration,
}

impl Default for ServoLoopConfig {
    fn default() -> Self {
        Self {
            target_points: 4096,
            predict_threshold: Duration::from_millis(1),
        }
    }
}

/// The serving loop: `LISTENING → RECEIVED → PREDICTING → RESPONDING`,
/// indefinitely.
///
/// The loop owns the policy for the process lifetime. Per-request failures
/// are contained: transport and inference errors each answer with an error
/// sentinel and the loop keeps serving.
pub struct ServoLoop {
    policy: DiffusionPolicy,
    resampler: Box<dyn CloudResampler>,
    config: ServoLoopConfig,
    request_index: u64,
}

impl ServoLoop {
    /// Assembles a serving loop around a loaded policy.
    #[must_use]
    pub fn new(
        policy: DiffusionPolicy,
        resampler: Box<dyn CloudResampler>,
        config: ServoLoopConfig,
    ) -> Self {
        Self {
            policy,
            resampler,
            config,
            request_index: 0,
        }
    }

    /// The wrapped policy.
    #[must_use]
    pub fn policy(&self) -> &DiffusionPolicy {
        &self.policy
    }

    /// Decodes a request through the modality allow-list.
    ///
    /// Only `point_cloud`, `state`, and (when the wrist is enabled)
    /// `wrist_point_cloud` enter the policy; every other key is flushed so
    /// stale fields from older protocol revisions can never reach the model.
    pub fn build_observation(&self, payload: &PayloadMap) -> Result<ObservationBatch> {
        let use_wrist = self.policy.config().profile.use_wrist;

        let flushed: Vec<&str> = payload
            .keys()
            .map(String::as_str)
            .filter(|k| {
                *k != "point_cloud" && *k != "state" && !(use_wrist && *k == "wrist_point_cloud")
            })
            .collect();
        if !flushed.is_empty() {
            debug!(?flushed, "flushing unused request keys");
        }

        let cloud = payload
            .get("point_cloud")
            .ok_or_else(|| KinetraError::transport("request is missing 'point_cloud'"))?
            .to_array3()?;
        let cloud = self.resampler.resample(&cloud, self.config.target_points)?;

        let state = payload
            .get("state")
            .ok_or_else(|| KinetraError::transport("request is missing 'state'"))?
            .to_array2()?;

        let wrist = if use_wrist {
            let wrist = payload
                .get("wrist_point_cloud")
                .ok_or_else(|| {
                    KinetraError::transport("wrist enabled but 'wrist_point_cloud' missing")
                })?
                .to_array3()?;
            Some(
                self.resampler
                    .resample(&wrist, self.config.target_points)?
                    .insert_axis(Axis(0)),
            )
        } else {
            None
        };

        Ok(ObservationBatch {
            point_cloud: Some(cloud.insert_axis(Axis(0))),
            wrist_point_cloud: wrist,
            agent_pos: Some(state.insert_axis(Axis(0))),
            ..Default::default()
        })
    }

    /// Runs one full `RECEIVED → PREDICTING` cycle.
    fn predict_cycle(&self, payload: &PayloadMap) -> Result<Array2<f32>> {
        let obs = self.build_observation(payload)?;
        let predicted = {
            let _scope = TimeScope::with_threshold(
                format!("predict_one_action_{}", self.request_index),
                self.config.predict_threshold,
            );
            self.policy.predict_action(&obs, None)?
        };
        ensure_finite("predicted action", &predicted.action)?;
        // Move off the batch axis; one request is one trajectory.
        Ok(predicted.action.index_axis(Axis(0), 0).to_owned())
    }

    /// Processes one received payload into a response.
    fn process(&mut self, payload: &PayloadMap) -> ActionResponse {
        self.request_index += 1;
        match self.predict_cycle(payload) {
            Ok(action) => {
                debug!(
                    request_index = self.request_index,
                    steps = action.shape()[0],
                    "inference cycle complete"
                );
                ActionResponse::Action {
                    action: TensorPayload::from_array2(&action),
                }
            }
            Err(e) => {
                error!(
                    request_index = self.request_index,
                    error = %e,
                    "inference cycle failed; answering with error sentinel"
                );
                ActionResponse::Error {
                    message: e.to_string(),
                    request_index: self.request_index,
                }
            }
        }
    }

    /// Serves requests forever.
    ///
    /// Only listener-level failures escape; per-request errors are answered
    /// and contained.
    pub async fn run(&mut self, server: &mut ResponseServer) -> Result<()> {
        info!(
            policy = ?self.policy,
            target_points = self.config.target_points,
            "serving loop entering LISTENING state"
        );
        loop {
            let response = match server.recv_request().await {
                Ok(payload) => self.process(&payload),
                Err(KinetraError::Transport { message }) => {
                    self.request_index += 1;
                    warn!(
                        request_index = self.request_index,
                        %message,
                        "malformed request payload"
                    );
                    ActionResponse::Error {
                        message,
                        request_index: self.request_index,
                    }
                }
                Err(e) => return Err(e),
            };
            if let Err(e) = server.send_response(&response).await {
                warn!(error = %e, "failed to deliver response; client likely gone");
            }
        }
    }
}

// =====================================================================================
// PRODUCTION TESTING & VALIDATION
// =====================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinetra_core::{
        ExecContext, FusionEncoderConfig, PolicyBundle, PolicyConfig, UniformResampler,
    };
    use ndarray::Array3;

    fn test_policy_bundle() -> PolicyBundle {
        PolicyBundle::seeded(
            PolicyConfig {
                action_shape: vec![20],
                horizon: 8,
                n_action_steps: 4,
                n_obs_steps: 2,
                num_inference_steps: 4,
                ..Default::default()
            },
            FusionEncoderConfig {
                feature_dim: 16,
                ..Default::default()
            },
            32,
            16,
            42,
        )
        .expect("seeded bundle")
    }

    fn test_loop() -> ServoLoop {
        let policy = test_policy_bundle()
            .into_policy(ExecContext::default())
            .expect("policy");
        ServoLoop::new(
            policy,
            Box::new(UniformResampler::default()),
            ServoLoopConfig {
                target_points: 64,
                ..Default::default()
            },
        )
    }

    fn good_payload() -> PayloadMap {
        let mut payload = PayloadMap::default();
        let cloud = Array3::from_shape_fn((2, 100, 3), |(t, n, c)| {
            (t as f32) + (n as f32) * 0.01 + (c as f32) * 0.001
        });
        payload.insert("point_cloud".into(), TensorPayload::from_array3(&cloud));
        payload.insert(
            "state".into(),
            TensorPayload::new(vec![2, 20], vec![0.5; 40]).unwrap(),
        );
        payload
    }

    #[test]
    fn tensor_payload_rejects_mismatched_shape() {
        assert!(TensorPayload::new(vec![2, 3], vec![0.0; 5]).is_err());
        assert!(TensorPayload::new(vec![2, 3], vec![0.0; 6]).is_ok());
    }

    #[test]
    fn tensor_payload_roundtrips() {
        let a = Array2::from_shape_fn((3, 4), |(i, j)| (i * 4 + j) as f32);
        let restored = TensorPayload::from_array2(&a).to_array2().unwrap();
        assert_eq!(a, restored);

        let b = Array3::from_shape_fn((2, 3, 4), |(i, j, k)| (i + j + k) as f32);
        let restored = TensorPayload::from_array3(&b).to_array3().unwrap();
        assert_eq!(b, restored);
    }

    #[test]
    fn tensor_payload_rank_checks() {
        let p = TensorPayload::new(vec![2, 3, 4], vec![0.0; 24]).unwrap();
        assert!(p.to_array2().is_err());
        assert!(p.to_array3().is_ok());
    }

    #[test]
    fn allow_list_flushes_unknown_keys() {
        let servo = test_loop();
        let mut payload = good_payload();
        payload.insert(
            "legacy_gripper_state".into(),
            TensorPayload::new(vec![1], vec![1.0]).unwrap(),
        );
        let obs = servo.build_observation(&payload).unwrap();
        assert!(obs.image.is_none());
        assert!(obs.wrist_point_cloud.is_none());
        let cloud = obs.point_cloud.unwrap();
        assert_eq!(cloud.dim(), (1, 2, 64, 3));
        assert_eq!(obs.agent_pos.unwrap().dim(), (1, 2, 20));
    }

    #[test]
    fn missing_modality_is_a_transport_error() {
        let servo = test_loop();
        let mut payload = good_payload();
        payload.remove("state");
        let err = servo.build_observation(&payload).unwrap_err();
        assert!(matches!(err, KinetraError::Transport { .. }));
    }

    #[tokio::test]
    async fn serving_loop_end_to_end() {
        let mut server = ResponseServer::bind("127.0.0.1", 0).await.unwrap();
        let addr = server.local_addr().unwrap();
        let mut servo = test_loop();
        tokio::spawn(async move {
            let _ = servo.run(&mut server).await;
        });

        let mut client = ResponseClient::connect("127.0.0.1", addr.port())
            .await
            .unwrap();

        // Extra keys are flushed, not fatal.
        let mut payload = good_payload();
        payload.insert(
            "stale_field".into(),
            TensorPayload::new(vec![3], vec![0.0; 3]).unwrap(),
        );
        match client.request(&payload).await.unwrap() {
            ActionResponse::Action { action } => {
                assert_eq!(action.shape, vec![4, 20]);
                assert!(action.data.iter().all(|v| v.is_finite()));
            }
            ActionResponse::Error { message, .. } => panic!("unexpected error: {message}"),
        }
    }

    #[tokio::test]
    async fn serving_loop_answers_errors_and_survives() {
        let mut server = ResponseServer::bind("127.0.0.1", 0).await.unwrap();
        let addr = server.local_addr().unwrap();
        let mut servo = test_loop();
        tokio::spawn(async move {
            let _ = servo.run(&mut server).await;
        });

        let mut client = ResponseClient::connect("127.0.0.1", addr.port())
            .await
            .unwrap();

        // A state tensor with the wrong rank must come back as an explicit
        // error sentinel, never an action.
        let mut bad = good_payload();
        bad.insert(
            "state".into(),
            TensorPayload::new(vec![40], vec![0.5; 40]).unwrap(),
        );
        match client.request(&bad).await.unwrap() {
            ActionResponse::Error { request_index, .. } => assert_eq!(request_index, 1),
            ActionResponse::Action { .. } => panic!("stale/undefined action must not be sent"),
        }

        // The loop must keep serving after the failed cycle.
        match client.request(&good_payload()).await.unwrap() {
            ActionResponse::Action { action } => assert_eq!(action.shape, vec![4, 20]),
            ActionResponse::Error { message, .. } => panic!("loop died after error: {message}"),
        }
    }

    #[tokio::test]
    async fn client_reconnect_rearms_the_accept_loop() {
        let mut server = ResponseServer::bind("127.0.0.1", 0).await.unwrap();
        let addr = server.local_addr().unwrap();
        let mut servo = test_loop();
        tokio::spawn(async move {
            let _ = servo.run(&mut server).await;
        });

        {
            let mut first = ResponseClient::connect("127.0.0.1", addr.port())
                .await
                .unwrap();
            let response = first.request(&good_payload()).await.unwrap();
            assert!(matches!(response, ActionResponse::Action { .. }));
        } // first client drops here

        let mut second = ResponseClient::connect("127.0.0.1", addr.port())
            .await
            .unwrap();
        let response = second.request(&good_payload()).await.unwrap();
        assert!(matches!(response, ActionResponse::Action { .. }));
    }
}
