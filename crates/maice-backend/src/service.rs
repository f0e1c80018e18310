// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use tracing::info;

use maice_bus::MessageBus;
use maice_config::Config;
use maice_metrics::MetricsSidecar;
use maice_store::SessionStore;
use maice_types::{RequestKind, ResponseEvent, SessionId};

use crate::{
    monitoring::Monitoring,
    orchestrator::{Orchestrator, SubmitOutcome},
    protocol::{
        ChatRequest, ClarificationRequest, CreateSessionRequest, CreateSessionResponse,
        ImageToLatexResponse, ImageUpload,
    },
};

/// Facade the HTTP collaborator talks to. One per backend process.
pub struct BackendService {
    orchestrator: Arc<Orchestrator>,
    monitoring: Monitoring,
    store: Arc<SessionStore>,
}

impl BackendService {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        store: Arc<SessionStore>,
        metrics: Arc<MetricsSidecar>,
        config: Arc<Config>,
    ) -> Self {
        let orchestrator = Orchestrator::new(bus.clone(), store.clone(), metrics, config);
        let monitoring = Monitoring::new(bus, store.clone());
        Self {
            orchestrator,
            monitoring,
            store,
        }
    }

    /// `POST /chat`: open a response-event stream for one user message.
    pub async fn chat(&self, user_id: &str, req: ChatRequest) -> anyhow::Result<SubmitOutcome> {
        self.orchestrator
            .submit(
                user_id,
                req.session_id,
                &req.message,
                req.image,
                RequestKind::Question,
            )
            .await
    }

    /// `POST /clarification`: feed one clarification answer back in.
    pub async fn clarification(
        &self,
        user_id: &str,
        req: ClarificationRequest,
    ) -> anyhow::Result<SubmitOutcome> {
        self.orchestrator
            .submit(
                user_id,
                Some(req.session_id),
                &req.clarification_answer,
                None,
                RequestKind::ClarificationResponse,
            )
            .await
    }

    /// `POST /session`: create a session without firing any agent.
    pub async fn create_session(
        &self,
        user_id: &str,
        req: CreateSessionRequest,
    ) -> anyhow::Result<CreateSessionResponse> {
        self.store.ensure_user(user_id).await?;
        let session = self
            .store
            .create(user_id, req.initial_question.as_deref())
            .await?;
        Ok(CreateSessionResponse {
            session_id: session.session_id,
        })
    }

    /// `DELETE /session/{id}`.
    pub async fn delete_session(&self, session_id: SessionId) -> anyhow::Result<()> {
        self.store.close(session_id).await?;
        Ok(())
    }

    /// `POST /image_to_latex`: run the conversion through the answerer
    /// and collect the single-chunk result.
    pub async fn image_to_latex(
        &self,
        user_id: &str,
        upload: ImageUpload,
    ) -> anyhow::Result<ImageToLatexResponse> {
        let file_size = upload.data.len();
        info!(user_id, filename = %upload.filename, file_size, "image-to-latex conversion");
        let outcome = self
            .orchestrator
            .submit(
                user_id,
                None,
                "",
                Some(upload.filename.clone()),
                RequestKind::ImageToLatex,
            )
            .await?;

        let mut events = outcome.events;
        let mut latex = String::new();
        let mut success = false;
        while let Some(ev) = events.recv().await {
            match ev {
                ResponseEvent::StreamingChunk { content, .. } => latex.push_str(&content),
                ResponseEvent::AnswerComplete => success = true,
                ResponseEvent::Error { .. } => {
                    success = false;
                    break;
                }
                ResponseEvent::Complete => break,
                _ => {}
            }
        }

        Ok(ImageToLatexResponse {
            latex,
            filename: upload.filename,
            file_size,
            content_type: upload.content_type,
            success,
        })
    }

    pub fn monitoring(&self) -> &Monitoring {
        &self.monitoring
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }
}
