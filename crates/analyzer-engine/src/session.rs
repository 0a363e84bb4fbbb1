use std::time::Duration;

use analyzer_contracts::AnalysisError;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::images::{StagedImage, StagingArea};
use crate::service::{AnalysisService, PendingAnalysis};

pub const NO_IMAGES_MESSAGE: &str = "Please add at least one image to analyze.";
pub const NO_QUERY_MESSAGE: &str = "Please enter a query.";
pub const BUSY_MESSAGE: &str = "An analysis is already in progress.";

#[derive(Debug, Clone)]
pub enum TurnContent {
    User {
        query: String,
        images: Vec<StagedImage>,
    },
    Bot {
        analyzed_images: Vec<StagedImage>,
    },
}

#[derive(Debug, Clone)]
pub struct ChatTurn {
    id: Uuid,
    created_at: DateTime<Utc>,
    content: TurnContent,
}

impl ChatTurn {
    pub fn user(query: impl Into<String>, images: Vec<StagedImage>) -> Self {
        Self::new(TurnContent::User {
            query: query.into(),
            images,
        })
    }

    pub fn bot(analyzed_images: Vec<StagedImage>) -> Self {
        Self::new(TurnContent::Bot { analyzed_images })
    }

    fn new(content: TurnContent) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            content,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn content(&self) -> &TurnContent {
        &self.content
    }

    pub fn is_user(&self) -> bool {
        matches!(self.content, TurnContent::User { .. })
    }

    pub fn images(&self) -> &[StagedImage] {
        match &self.content {
            TurnContent::User { images, .. } => images,
            TurnContent::Bot { analyzed_images } => analyzed_images,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Analyzed { images: usize },
    Failed(AnalysisError),
}

/// Interactive-context state. Only this type mutates staging, history, busy flag and
/// last error; the worker behind [`PendingAnalysis`] only delivers its final value.
pub struct ChatSession {
    service: AnalysisService,
    staging: StagingArea,
    turns: Vec<ChatTurn>,
    pending: Option<PendingAnalysis>,
    error_message: Option<String>,
}

impl ChatSession {
    pub fn new(service: AnalysisService) -> Self {
        Self {
            service,
            staging: StagingArea::new(),
            turns: Vec::new(),
            pending: None,
            error_message: None,
        }
    }

    pub fn service(&self) -> &AnalysisService {
        &self.service
    }

    /// Later submissions use `service`; an in-flight call keeps its own.
    pub fn replace_service(&mut self, service: AnalysisService) {
        self.service = service;
    }

    pub fn stage_images(&mut self, images: Vec<StagedImage>) -> usize {
        self.staging.stage(images)
    }

    pub fn remove_staged(&mut self, id: Uuid) -> Option<StagedImage> {
        self.staging.remove(id)
    }

    pub fn remove_staged_at(&mut self, index: usize) -> Option<StagedImage> {
        self.staging.remove_at(index)
    }

    pub fn clear_staged(&mut self) {
        self.staging.clear();
    }

    pub fn staged(&self) -> &[StagedImage] {
        self.staging.images()
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn is_loading(&self) -> bool {
        self.pending.is_some()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Returns `false` and records a message when the submission is rejected.
    pub fn submit(&mut self, query: &str) -> bool {
        if self.is_loading() {
            self.error_message = Some(BUSY_MESSAGE.to_string());
            return false;
        }
        if self.staging.is_empty() {
            self.error_message = Some(NO_IMAGES_MESSAGE.to_string());
            return false;
        }
        if query.trim().is_empty() {
            self.error_message = Some(NO_QUERY_MESSAGE.to_string());
            return false;
        }

        self.error_message = None;
        let images = self.staging.take_all();
        self.turns.push(ChatTurn::user(query, images.clone()));
        self.pending = Some(self.service.submit(images, query));
        true
    }

    pub fn poll(&mut self) -> Option<Completion> {
        let result = self.pending.as_ref()?.try_complete()?;
        Some(self.apply(result))
    }

    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<Completion> {
        let result = self.pending.as_ref()?.wait_timeout(timeout)?;
        Some(self.apply(result))
    }

    pub fn wait(&mut self) -> Option<Completion> {
        let pending = self.pending.take()?;
        Some(self.apply(pending.wait()))
    }

    fn apply(&mut self, result: Result<Vec<StagedImage>, AnalysisError>) -> Completion {
        self.pending = None;
        match result {
            Ok(analyzed_images) => {
                let images = analyzed_images.len();
                self.turns.push(ChatTurn::bot(analyzed_images));
                Completion::Analyzed { images }
            }
            Err(err) => {
                self.error_message = Some(err.to_string());
                Completion::Failed(err)
            }
        }
    }
}
