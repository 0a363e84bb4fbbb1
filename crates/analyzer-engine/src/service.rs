use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use analyzer_contracts::error::error_chain_text;
use analyzer_contracts::events::{AnalysisEvent, EventWriter, ResultMapping};
use analyzer_contracts::segmentation::{segment_response_detailed, PARSING_ERROR};
use analyzer_contracts::{AnalysisError, AnalysisResult};
use anyhow::anyhow;

use crate::config::AnalyzerConfig;
use crate::images::StagedImage;
use crate::providers::{
    default_provider_registry, AnalysisProvider, ProviderAnalysisRequest,
};
use crate::request::build_analysis_request;

const ERROR_MESSAGE_MAX_CHARS: usize = 1024;
const NO_TEXT_CONTENT: &str = "No text content in API response";

/// Drives one request/response cycle per submission.
#[derive(Clone)]
pub struct AnalysisService {
    provider: Arc<dyn AnalysisProvider>,
    model: String,
    events: Option<EventWriter>,
}

impl AnalysisService {
    pub fn new(provider: Arc<dyn AnalysisProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            events: None,
        }
    }

    pub fn from_config(config: &AnalyzerConfig) -> anyhow::Result<Self> {
        let provider = default_provider_registry(config)
            .for_model(&config.model)
            .ok_or_else(|| anyhow!("no provider registered for model '{}'", config.model))?;
        Ok(Self::new(provider, config.model.clone()))
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Starts the call on a worker thread; the handle yields exactly one result.
    pub fn submit(&self, images: Vec<StagedImage>, query: impl Into<String>) -> PendingAnalysis {
        let (sender, receiver) = mpsc::channel();
        let service = self.clone();
        let query = query.into();
        let spawned = thread::Builder::new()
            .name("analysis-worker".to_string())
            .spawn(move || {
                let result = service.analyze(images, &query);
                let _ = sender.send(result);
            });
        if let Err(err) = spawned {
            let (sender, receiver) = mpsc::channel();
            let _ = sender.send(Err(AnalysisError::general(format!(
                "An unexpected error occurred: failed to start analysis worker: {err}"
            ))));
            return PendingAnalysis { receiver };
        }
        PendingAnalysis { receiver }
    }

    pub fn analyze(
        &self,
        images: Vec<StagedImage>,
        query: &str,
    ) -> AnalysisResult<Vec<StagedImage>> {
        let started = Instant::now();
        self.record(AnalysisEvent::Submitted {
            provider: self.provider.name().to_string(),
            model: self.model.clone(),
            image_count: images.len(),
            query_chars: query.chars().count(),
        })?;

        let result = self.run(images, query, started);
        if let Err(err) = &result {
            let _ = self.record(AnalysisEvent::Failed {
                provider: self.provider.name().to_string(),
                model: self.model.clone(),
                kind: err.kind().to_string(),
                message: err.message().to_string(),
                latency_ms: elapsed_millis(started),
            });
        }
        result
    }

    fn run(
        &self,
        images: Vec<StagedImage>,
        query: &str,
        started: Instant,
    ) -> AnalysisResult<Vec<StagedImage>> {
        let content = build_analysis_request(&images, query)?;
        let response = self
            .provider
            .generate(&ProviderAnalysisRequest {
                model: self.model.clone(),
                content,
            })
            .map_err(|err| AnalysisError::api(error_chain_text(&err, ERROR_MESSAGE_MAX_CHARS)))?;

        let Some(text) = response.text else {
            let message = match response.diagnostic {
                Some(diagnostic) => format!("{NO_TEXT_CONTENT} ({diagnostic})."),
                None => format!("{NO_TEXT_CONTENT}."),
            };
            return Err(AnalysisError::api(message));
        };

        let image_count = images.len();
        let segmentation = segment_response_detailed(&text, image_count);
        let (analyzed, degraded) = attach_results(images, &segmentation.results, &text);

        // A failed log write never discards the analyzed reply.
        let _ = self.record(AnalysisEvent::Completed {
            provider: self.provider.name().to_string(),
            model: self.model.clone(),
            image_count,
            mode: ResultMapping::new(segmentation.mode, degraded),
            matched: segmentation.matched,
            reply_chars: text.chars().count(),
            latency_ms: elapsed_millis(started),
            provider_request: response.provider_request,
            provider_response: response.provider_response,
        });
        Ok(analyzed)
    }

    fn record(&self, event: AnalysisEvent) -> AnalysisResult<()> {
        let Some(events) = self.events.as_ref() else {
            return Ok(());
        };
        events.record(event).map(|_| ()).map_err(|err| {
            AnalysisError::general(format!(
                "An unexpected error occurred: {}",
                error_chain_text(&err, ERROR_MESSAGE_MAX_CHARS)
            ))
        })
    }
}

/// Pairs results with images in order. A count mismatch degrades to the raw reply
/// on the first image and returns `true`.
pub fn attach_results(
    mut images: Vec<StagedImage>,
    results: &[String],
    raw_text: &str,
) -> (Vec<StagedImage>, bool) {
    if results.len() == images.len() {
        for (image, result) in images.iter_mut().zip(results) {
            image.set_analysis_result(result.clone());
        }
        return (images, false);
    }

    for (index, image) in images.iter_mut().enumerate() {
        if index == 0 {
            image.set_analysis_result(format!(
                "Failed to parse results correctly. Full response: {raw_text}"
            ));
        } else {
            image.set_analysis_result(PARSING_ERROR);
        }
    }
    (images, true)
}

fn elapsed_millis(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// One-shot completion handle for a submitted analysis.
#[derive(Debug)]
pub struct PendingAnalysis {
    receiver: Receiver<AnalysisResult<Vec<StagedImage>>>,
}

impl PendingAnalysis {
    pub fn wait(self) -> AnalysisResult<Vec<StagedImage>> {
        self.receiver
            .recv()
            .unwrap_or_else(|_| Err(worker_lost()))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<AnalysisResult<Vec<StagedImage>>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(worker_lost())),
        }
    }

    pub fn try_complete(&self) -> Option<AnalysisResult<Vec<StagedImage>>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(worker_lost())),
        }
    }
}

fn worker_lost() -> AnalysisError {
    AnalysisError::general("An unexpected error occurred: analysis worker exited without a result")
}
