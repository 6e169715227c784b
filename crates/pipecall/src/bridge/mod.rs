//! IPC bridge for host-worker calls.
//!
//! This module provides the wire format and transport for one-shot
//! request/response exchanges between the host and the worker process.
//!
//! # Architecture
//!
//! - **frame**: Frame type, sentinel convention, protocol anomalies
//! - **codec**: Line framing codec for AsyncRead/AsyncWrite
//! - **lease**: Single-owner leases on endpoint names
//! - **transport**: One-shot listeners and clients (Unix sockets, named pipes)

pub mod codec;
pub mod frame;
pub mod lease;
pub mod transport;

pub use frame::{ERROR_TAG, Frame, FrameError, ProtocolAnomaly, READY_VERB};
pub use transport::{
    Endpoint, OneShotListener, Received, TransportError, send_frame, send_frame_patient,
};
