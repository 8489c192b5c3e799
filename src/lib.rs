//! cryptoline — lookaside crypto pipeline for descriptor-ring accelerators.
//!
//! cryptoline turns cipher, AEAD and hash requests into hardware commands,
//! queues them on per-ring FIFOs drained by one dispatcher thread per ring,
//! and completes them from notified or polled result retrieval. It also
//! manages the install/teardown lifecycle of IPsec associations and DTLS
//! tunnels offloaded to the same hardware.
//!
//! The accelerator's driver library (SA builder, token builder, DMA
//! service, packet engine, classifier) is consumed through the traits in
//! [`ddk`]. The `sim` feature provides a software implementation.
//!
//! # Quick Start
//!
//! ```rust
//! use cryptoline::sim::Sim;
//! use cryptoline::{CipherContext, CipherRequest, CipherSpec, ConfigBuilder, Engine};
//!
//! let sim = Sim::new(2);
//! let config = ConfigBuilder::new().rings(2).build()?;
//! let engine = Engine::start(config, sim.services())?;
//!
//! let ctx = CipherContext::new(CipherSpec::gcm(16))?;
//! engine.set_key(&ctx, &[0u8; 16])?;
//! let sealed = engine
//!     .submit(&ctx, CipherRequest::encrypt(&[0u8; 12], vec![0u8; 16]))?
//!     .wait()?;
//! assert_eq!(sealed.data.len(), 32);
//! # Ok::<(), cryptoline::Error>(())
//! ```

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod context;
pub(crate) mod counter;
pub(crate) mod dispatch;
pub(crate) mod dma;
pub(crate) mod engine;
pub(crate) mod engine_data;
pub(crate) mod harvest;
pub(crate) mod hash;
pub(crate) mod job;
pub(crate) mod metrics;
pub(crate) mod notify;
pub(crate) mod request;
pub(crate) mod ring;
pub(crate) mod submit;

// ── Public modules ──────────────────────────────────────────────────────
pub mod algo;
pub mod completion;
pub mod config;
pub mod ddk;
pub mod error;
pub mod offload;
#[cfg(feature = "sim")]
pub mod sim;

// ── Re-exports: Engine ──────────────────────────────────────────────────

/// The crypto offload engine.
pub use engine::Engine;
/// Result of queueing a request.
pub use ring::Enqueued;
/// Bounds-checked ring index.
pub use ring::RingId;

// ── Re-exports: Requests ────────────────────────────────────────────────

/// Cipher / AEAD transform instance.
pub use context::CipherContext;
/// Algorithm selection of a cipher context.
pub use context::CipherSpec;
/// Encrypt or decrypt.
pub use context::Direction;
/// Hash or HMAC transform instance.
pub use hash::HashContext;
/// Multi-part hash computation.
pub use hash::HashSession;
/// Result of a cipher request.
pub use request::CipherOutput;
/// A cipher or AEAD request.
pub use request::CipherRequest;
/// Handle to the eventual result of a queued request.
pub use request::Ticket;

// ── Re-exports: Algorithms ──────────────────────────────────────────────

/// AEAD flavour.
pub use algo::AeadKind;
/// Authentication algorithm.
pub use algo::AuthAlg;
/// Block cipher.
pub use algo::CipherAlg;
/// Cipher mode.
pub use algo::CipherMode;
/// Hash algorithm.
pub use algo::HashAlg;

// ── Re-exports: Offload ─────────────────────────────────────────────────

/// DTLS tunnel parameters.
pub use offload::dtls::{DtlsKeys, DtlsParams, DtlsSecMode, TunnelId};
/// IPsec association types.
pub use offload::ipsec::{
    AssocHandle, NatT, OffloadState, XfrmCrypto, XfrmDirection, XfrmMode, XfrmState,
};

// ── Re-exports: Shared types ────────────────────────────────────────────

/// Engine configuration.
pub use config::Config;
/// Builder for [`Config`] with discoverable methods and `build()` validation.
pub use config::ConfigBuilder;
/// Result notification policy configuration.
pub use config::NotifyConfig;
/// Polled retrieval configuration.
pub use config::PollConfig;
/// Pipeline errors.
pub use error::Error;
/// Result alias.
pub use error::Result;
/// Host-visible status class of an error.
pub use error::Status;
