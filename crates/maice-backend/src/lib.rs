// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The backend half of the fleet: everything that runs inside the HTTP
//! collaborator's process.
//!
//! ```text
//! HTTP collaborator
//!     │  ChatRequest / ClarificationRequest
//!     ▼
//! BackendService ──► Orchestrator ──publish──► maice:requests:<agent>
//!     ▲                   │ lease, stage routing, watchdog
//!     │                   ▼
//!     │          coordination topics (verdict, clarify, cancel)
//!     │
//!     └──◄── StreamingPipeline ◄──claim── maice:agent_to_backend_stream_session_<id>
//!              reorder, gap flush, backpressure
//! ```
//!
//! The orchestrator admits one request per session (bus lease), routes it
//! by stage, and watches the response stream to advance the session state
//! machine. The pipeline reassembles out-of-order chunk streams into the
//! exact order the client must see.

pub mod monitoring;
pub mod orchestrator;
pub mod pipeline;
pub mod protocol;
pub mod service;

pub use monitoring::{ComponentHealth, HealthReport, Monitoring};
pub use orchestrator::{Orchestrator, SubmitOutcome};
pub use protocol::{
    ChatRequest, ClarificationRequest, CreateSessionRequest, CreateSessionResponse, ImageUpload,
    ImageToLatexResponse,
};
pub use service::BackendService;
