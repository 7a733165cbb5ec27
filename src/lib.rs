/* src/lib.rs */
#![warn(missing_docs)]
//! # Kinetra: Real-Time Diffusion-Policy Inference Engine
//!
//! Serving-side core for a trained robot-control diffusion policy. A
//! request/response server receives multi-modal observations over a TCP
//! socket, runs a conditional denoising-diffusion sampler to predict a short
//! horizon of future actions, and returns the execution window to the
//! controller loop.
//!
//! ## Crate Layout
//!
//! - [`kinetra_core`] — normalization, observation fusion, conditioning
//!   masks, the DDPM schedule and sampler, the policy facade, and checkpoint
//!   bundles.
//! - [`servo_link`] — wire payloads, framed TCP transport, and the serving
//!   loop state machine.
//! - [`timescope`] — scoped wall-clock diagnostics for latency budgets.
//!
/*▫~•◦────────────────────────────────────────────────────────────────────────────────────‣
 * © 2025 ArcMoon Studios ◦ SPDX-License-Identifier MIT OR Apache-2.0 ◦ Author: Lord Xyn ✶
 *///◦────────────────────────────────────────────────────────────────────────────────────‣

pub mod kinetra_core;
pub mod servo_link;
pub mod timescope;
