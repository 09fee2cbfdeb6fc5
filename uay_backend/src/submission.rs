use crate::config::UploadConfig;
use crate::error::{UayError, UayResult, ValidationError};
use crate::media::{ObjectStore, PendingFile, ProgressFn};
use crate::models::{Author, NewPost, POSTS};
use crate::store::SharedStore;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AttachReport {
    pub accepted: Vec<String>,
    /// Over the per-file size limit.
    pub oversized: Vec<String>,
    /// Past the per-post attachment budget.
    pub excess: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadProgress {
    pub name: String,
    pub sent: u64,
    pub total: u64,
}

enum UploadEvent {
    Progress {
        slot: u64,
        sent: u64,
        total: u64,
    },
    Finished {
        slot: u64,
        result: Result<String, String>,
    },
}

struct InFlight {
    progress: UploadProgress,
    handle: JoinHandle<()>,
}

/// One author's compose session: attachments upload in the background and
/// the post is only written once every accepted upload has settled.
pub struct SubmissionPipeline {
    store: SharedStore,
    objects: Arc<dyn ObjectStore>,
    config: UploadConfig,
    author: Author,
    tx: UnboundedSender<UploadEvent>,
    rx: UnboundedReceiver<UploadEvent>,
    next_slot: u64,
    in_flight: BTreeMap<u64, InFlight>,
    completed: Vec<String>,
    failed: Vec<String>,
}

impl SubmissionPipeline {
    pub fn new(
        store: SharedStore,
        objects: Arc<dyn ObjectStore>,
        config: UploadConfig,
        author: Author,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            store,
            objects,
            config,
            author,
            tx,
            rx,
            next_slot: 0,
            in_flight: BTreeMap::new(),
            completed: Vec::new(),
            failed: Vec::new(),
        }
    }

    /// Starts uploading the given files. Must run inside a tokio runtime.
    pub fn attach(&mut self, files: Vec<PendingFile>) -> AttachReport {
        self.poll();
        let mut report = AttachReport::default();
        for file in files {
            if file.size() > self.config.max_upload_bytes {
                tracing::warn!(
                    name = %file.name,
                    bytes = file.size(),
                    limit = self.config.max_upload_bytes,
                    "attachment too large"
                );
                report.oversized.push(file.name);
                continue;
            }
            if self.completed.len() + self.in_flight.len() >= self.config.max_attachments {
                report.excess.push(file.name);
                continue;
            }
            report.accepted.push(file.name.clone());
            self.spawn_upload(file);
        }
        if !report.excess.is_empty() {
            tracing::warn!(
                dropped = report.excess.len(),
                limit = self.config.max_attachments,
                "attachment budget exhausted"
            );
        }
        report
    }

    fn spawn_upload(&mut self, file: PendingFile) {
        self.next_slot += 1;
        let slot = self.next_slot;
        let progress_tx = self.tx.clone();
        let progress: ProgressFn = Arc::new(move |sent, total| {
            let _ = progress_tx.send(UploadEvent::Progress { slot, sent, total });
        });
        let objects = self.objects.clone();
        let owner_id = self.author.id.clone();
        let tx = self.tx.clone();
        let name = file.name.clone();
        let total = file.size();

        let handle = tokio::spawn(async move {
            let result = objects
                .upload(&owner_id, &file.name, file.data, progress)
                .await
                .map_err(|err| format!("{err:#}"));
            let _ = tx.send(UploadEvent::Finished { slot, result });
        });
        self.in_flight.insert(
            slot,
            InFlight {
                progress: UploadProgress {
                    name,
                    sent: 0,
                    total,
                },
                handle,
            },
        );
    }

    /// Applies finished and progress reports. Returns how many were applied.
    pub fn poll(&mut self) -> usize {
        let mut applied = 0;
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    self.apply(event);
                    applied += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return applied,
            }
        }
    }

    fn apply(&mut self, event: UploadEvent) {
        match event {
            UploadEvent::Progress { slot, sent, total } => {
                if let Some(upload) = self.in_flight.get_mut(&slot) {
                    upload.progress.sent = sent;
                    upload.progress.total = total;
                }
            }
            UploadEvent::Finished { slot, result } => {
                let Some(upload) = self.in_flight.remove(&slot) else {
                    return;
                };
                match result {
                    Ok(uri) => {
                        tracing::info!(name = %upload.progress.name, uri = %uri, "upload finished");
                        self.completed.push(uri);
                    }
                    Err(error) => {
                        tracing::warn!(
                            name = %upload.progress.name,
                            error = %error,
                            "upload failed"
                        );
                        self.failed.push(upload.progress.name);
                    }
                }
            }
        }
    }

    pub fn outstanding(&self) -> usize {
        self.in_flight.len()
    }

    pub fn progress(&self) -> Vec<UploadProgress> {
        self.in_flight
            .values()
            .map(|upload| upload.progress.clone())
            .collect()
    }

    /// URIs of finished uploads, in completion order.
    pub fn completed_media(&self) -> &[String] {
        &self.completed
    }

    pub fn failed_uploads(&self) -> &[String] {
        &self.failed
    }

    pub async fn wait_for_uploads(&mut self) {
        self.poll();
        while !self.in_flight.is_empty() {
            match self.rx.recv().await {
                Some(event) => self.apply(event),
                None => break,
            }
        }
    }

    /// Writes the post. Refused while uploads are still running.
    pub fn submit(&mut self, body: &str) -> UayResult<String> {
        self.poll();
        if !self.in_flight.is_empty() {
            return Err(UayError::UploadsPending(self.in_flight.len()));
        }
        let body = body.trim();
        if body.is_empty() && self.completed.is_empty() {
            return Err(ValidationError::EmptyPost.into());
        }

        let media_urls = std::mem::take(&mut self.completed);
        let attachments = media_urls.len();
        let post_id = self.store.create(
            POSTS,
            NewPost {
                author: self.author.clone(),
                body: body.to_string(),
                media_urls: media_urls.clone(),
                lineage: None,
            }
            .into_fields(),
        );
        let post_id = match post_id {
            Ok(id) => id,
            Err(err) => {
                // Keep the uploads so the user can retry.
                self.completed = media_urls;
                return Err(err.into());
            }
        };
        self.failed.clear();
        tracing::info!(
            post_id = %post_id,
            author_id = %self.author.id,
            attachments,
            "post submitted"
        );
        Ok(post_id)
    }

    /// Aborts running uploads and forgets the session's attachments.
    pub fn stop(&mut self) {
        for (_, upload) in std::mem::take(&mut self.in_flight) {
            upload.handle.abort();
        }
        self.poll();
        self.completed.clear();
        self.failed.clear();
    }
}

impl Drop for SubmissionPipeline {
    fn drop(&mut self) {
        for upload in self.in_flight.values() {
            upload.handle.abort();
        }
    }
}
