use crate::config::ControllerConfig;
use crate::error::{ControllerError, Result};
use crate::mirror::ClusterCache;
use crate::traits::ClusterMirror;
use futures_util::StreamExt;
use podlink_core::{parse_event, Namespace, NamespaceRecord, Pod, PodEvent, PodRecord};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lightweight HTTP client for the orchestrator API: namespace and pod
/// listings, and the pod watch stream that feeds the event processor.
pub struct KubeClient {
    base_url: String,
    client: Client,
    token: Option<String>,
    request_timeout: Duration,
}

impl KubeClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
            token: None,
            request_timeout,
        }
    }

    /// Send a bearer token with every request
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn list<T: DeserializeOwned>(&self, op: &str, path: &str) -> Result<Vec<T>> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);

        let resp = self
            .authorized(self.client.get(&url).timeout(self.request_timeout))
            .send()
            .await
            .map_err(|e| request_error(op, e))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ControllerError::remote_failure(
                op,
                format!("status {}: {}", status, body),
            ));
        }

        let body: serde_json::Value = resp.json().await.map_err(|e| {
            ControllerError::remote_failure(op, format!("Failed to parse list: {}", e))
        })?;
        let items = body["items"].as_array().cloned().unwrap_or_default();

        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value(item) {
                Ok(obj) => out.push(obj),
                Err(e) => warn!("Failed to parse item from {}: {}", path, e),
            }
        }
        Ok(out)
    }

    /// GET /api/v1/namespaces
    pub async fn list_namespaces(&self, config: &ControllerConfig) -> Result<Vec<NamespaceRecord>> {
        let namespaces: Vec<Namespace> = self.list("namespace-list", "/api/v1/namespaces").await?;
        Ok(namespaces
            .iter()
            .filter_map(|ns| {
                NamespaceRecord::from_namespace(ns, |name| config.isolated_pod_network(name))
            })
            .collect())
    }

    /// GET /api/v1/pods
    pub async fn list_pods(&self) -> Result<Vec<PodRecord>> {
        let pods: Vec<Pod> = self.list("pod-list", "/api/v1/pods").await?;
        Ok(pods.iter().filter_map(PodRecord::from_pod).collect())
    }

    /// Re-list pods into the mirror, dropping pods whose delete the watch
    /// missed. Returns how many were dropped.
    pub async fn resync_pods(&self, cache: &ClusterCache) -> Result<usize> {
        let known: HashSet<String> = cache.pod_uids().into_iter().collect();
        let pods = self.list_pods().await?;
        let dropped = cache.replace_pods(pods, &known);
        if dropped > 0 {
            info!("Dropped {} pods missing from the pod listing", dropped);
        }
        Ok(dropped)
    }

    /// Follow GET /api/v1/pods?watch=true until cancelled or the stream ends.
    /// Each event updates the mirror first and is then handed to `events`.
    pub async fn watch_pods(
        &self,
        cache: &ClusterCache,
        events: &mpsc::Sender<PodEvent>,
        token: CancellationToken,
    ) -> Result<()> {
        let url = format!("{}/api/v1/pods?watch=true", self.base_url);
        info!("Watching pods at {}", url);

        let resp = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|e| request_error("pod-watch", e))?;
        if !resp.status().is_success() {
            return Err(ControllerError::remote_failure(
                "pod-watch",
                format!("status {}", resp.status()),
            ));
        }

        let mut stream = resp.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        loop {
            let chunk = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                info!("Pod watch stream ended");
                return Ok(());
            };
            let chunk = chunk.map_err(|e| request_error("pod-watch", e))?;
            buffer.extend_from_slice(&chunk);

            for line in drain_lines(&mut buffer) {
                let event = match parse_event(&line) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("Skipping malformed watch event: {}", e);
                        continue;
                    }
                };
                apply_to_cache(cache, &event);
                if events.send(event).await.is_err() {
                    info!("Event channel closed, stopping pod watch");
                    return Ok(());
                }
            }
        }
    }
}

fn request_error(op: &str, e: reqwest::Error) -> ControllerError {
    if e.is_timeout() {
        ControllerError::timeout(op)
    } else {
        ControllerError::remote_failure(op, format!("HTTP request failed: {}", e))
    }
}

/// Take every complete, non-empty line out of `buffer`, leaving a trailing
/// partial line in place. Lines are decoded only once complete, so a
/// character split across chunks survives; invalid UTF-8 lines are dropped.
fn drain_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let Some(last_newline) = buffer.iter().rposition(|b| *b == b'\n') else {
        return Vec::new();
    };
    let rest = buffer.split_off(last_newline + 1);
    let complete = std::mem::replace(buffer, rest);

    let mut lines = Vec::new();
    for raw in complete.split(|b| *b == b'\n') {
        match std::str::from_utf8(raw) {
            Ok(line) if !line.trim().is_empty() => lines.push(line.trim().to_string()),
            Ok(_) => {}
            Err(e) => warn!("Skipping watch line that is not UTF-8: {}", e),
        }
    }
    lines
}

/// Keep the pod mirror in step with a watch event
pub fn apply_to_cache(cache: &ClusterCache, event: &PodEvent) {
    match event {
        PodEvent::Added(pod) | PodEvent::Modified(pod) => cache.upsert_pod(pod.clone()),
        PodEvent::Deleted(pod) => {
            cache.remove_pod(&pod.uid);
        }
        PodEvent::Unknown { .. } => {}
    }
}
