// HTTP/WebSocket client for the ComfyUI backend.
//
// Execution is queued with POST /prompt, tracked by reading the websocket and
// polling /history, and the finished images are pulled down via /view.

use anyhow::{Context, Result};
use futures::{select, FutureExt, StreamExt};
use lazy_static::lazy_static;
use log::{debug, info, trace, warn};
use serde::Deserialize;
use serde_json::Value;
use tokio_retry::{strategy::ExponentialBackoff, Retry};
use tokio_tungstenite as ws;

use crate::config::BackendConfig;
use crate::flow::Flow;
use crate::values::value_at_index;

lazy_static! {
    static ref HTTP: reqwest::Client = reqwest::Client::new();
}

/// One saved image, as named in the execution history.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OutputImage {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(default, rename = "type")]
    pub kind: String,
}

pub struct ComfyClient {
    host: String,
    port: u16,
    client_id: String,
}

impl ComfyClient {
    pub fn new(backend: &BackendConfig) -> Self {
        let client_id = backend
            .client_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self {
            host: backend.host.clone(),
            port: backend.port,
            client_id,
        }
    }

    fn http_url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.host, self.port, path)
    }

    /// Fetches the full node registry dump.
    pub async fn object_info(&self) -> Result<Value> {
        HTTP.get(self.http_url("/object_info"))
            .send()
            .await
            .context("failed to fetch object_info")?
            .json()
            .await
            .context("failed to parse object_info")
    }

    /// Queues a flow for execution and returns its prompt id. Submission is
    /// retried with backoff; the backend drops requests while restarting.
    pub async fn queue(&self, flow: &Flow) -> Result<String> {
        #[derive(Deserialize)]
        struct QueueResponse {
            prompt_id: String,
            #[allow(dead_code)]
            number: u32,
        }

        let body = serde_json::json!({
            "prompt": flow.to_prompt(),
            "client_id": self.client_id,
        });
        let body = serde_json::to_string(&body).context("failed to serialize prompt")?;

        let retry_strategy = ExponentialBackoff::from_millis(50)
            .max_delay(std::time::Duration::from_secs(2))
            .take(5);
        let text = Retry::spawn(retry_strategy, || async {
            let response = HTTP
                .post(self.http_url("/prompt"))
                .header("Content-Type", "application/json")
                .body(body.clone())
                .send()
                .await
                .context("failed to send prompt")?;
            response.text().await.context("failed to read response")
        })
        .await
        .context("ran out of retries queueing prompt")?;

        trace!("Queue response: {}", text);
        let parsed =
            serde_json::from_str::<QueueResponse>(&text).context("failed to parse queue response")?;
        debug!("Got prompt ID {}", parsed.prompt_id);
        Ok(parsed.prompt_id)
    }

    /// Waits for a queued prompt to finish and returns the images it saved.
    /// We limit the polling traffic by reading the websocket, only hitting
    /// /history when something happens or a full timeout tick passes. If the
    /// websocket drops, we keep going on a fixed polling tick instead; the
    /// render survives a lost connection.
    pub async fn wait_for_outputs(&self, prompt_id: &str) -> Result<Vec<OutputImage>> {
        let mut images = None;
        let mut ws_client = ws::connect_async(format!(
            "ws://{}:{}/ws?clientId={}",
            self.host, self.port, self.client_id
        ))
        .await
        .context("failed to connect to websocket")?
        .0;
        let mut ws_open = true;
        for _ in 0..120 {
            if ws_open {
                select! {
                    msg = ws_client.next() => {
                        // Something happened; poll the history below.
                        ws_open = ws_still_open(&msg);
                    },
                    _ = futures_time::task::sleep(futures_time::time::Duration::from_secs(30)).fuse() => {
                        warn!("Websocket sleep timed out");
                        // Shouldn't happen, but poll anyway and try to recover.
                    },
                };
            } else {
                futures_time::task::sleep(futures_time::time::Duration::from_secs(5)).await;
            }
            trace!("Polling history");
            let history: Value = HTTP
                .get(self.http_url(&format!("/history/{}", prompt_id)))
                .send()
                .await
                .context("failed to poll history")?
                .json()
                .await
                .context("failed to parse history")?;
            // An empty history means the prompt hasn't finished yet.
            if history.as_object().map(|o| o.is_empty()).unwrap_or(false) {
                continue;
            }
            trace!("History: {:?}", history);
            let outputs = history
                .get(prompt_id)
                .and_then(|entry| entry.get("outputs"))
                .context("history missing outputs")?;
            images = Some(extract_images(outputs)?);
            break;
        }
        let images = images.ok_or_else(|| anyhow::anyhow!("timed out waiting for images"))?;
        info!("Prompt {} produced {} image(s)", prompt_id, images.len());
        Ok(images)
    }

    /// Downloads a single saved image.
    pub async fn fetch_image(&self, image: &OutputImage) -> Result<Vec<u8>> {
        let blob = HTTP
            .get(self.http_url("/view"))
            .query(&[
                ("filename", image.filename.as_str()),
                ("subfolder", image.subfolder.as_str()),
                ("type", image.kind.as_str()),
            ])
            .send()
            .await
            .context("failed to download image")?
            .bytes()
            .await
            .context("failed to read image")?;
        Ok(blob.into())
    }
}

/// Decides whether the websocket is still worth reading. A closed or broken
/// stream would otherwise resolve `next()` instantly with `None` on every
/// iteration, eating the whole polling budget in milliseconds.
fn ws_still_open<M: std::fmt::Debug, E: std::fmt::Display>(msg: &Option<Result<M, E>>) -> bool {
    match msg {
        Some(Ok(msg)) => {
            trace!("Got websocket message: {:?}", msg);
            true
        }
        Some(Err(e)) => {
            warn!("Websocket error, falling back to timed polling: {}", e);
            false
        }
        None => {
            warn!("Websocket closed, falling back to timed polling");
            false
        }
    }
}

/// Pulls the saved-image entries out of a history outputs mapping. Most save
/// nodes report them under "images"; some wrap their outputs in a "result"
/// sequence instead, which value_at_index normalizes.
fn extract_images(outputs: &Value) -> Result<Vec<OutputImage>> {
    let outputs = outputs.as_object().context("outputs not a mapping")?;
    let mut images = Vec::new();
    for (node_id, node_output) in outputs {
        let list = match node_output.get("images") {
            Some(list) => list,
            None => match value_at_index(node_output, 0) {
                Ok(list) => list,
                // Not an image-producing node.
                Err(_) => continue,
            },
        };
        let list = match list.as_array() {
            Some(list) => list,
            None => continue,
        };
        for entry in list {
            match serde_json::from_value::<OutputImage>(entry.clone()) {
                Ok(image) => images.push(image),
                Err(e) => warn!("Skipping malformed image entry from node {}: {}", node_id, e),
            }
        }
    }
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ws_still_open_on_message() {
        let msg: Option<Result<String, String>> = Some(Ok("progress".to_string()));
        assert!(ws_still_open(&msg));
    }

    #[test]
    fn test_ws_closed_or_broken_stops_reading() {
        // A dead stream must not keep consuming polling attempts.
        let closed: Option<Result<String, String>> = None;
        assert!(!ws_still_open(&closed));
        let broken: Option<Result<String, String>> = Some(Err("connection reset".to_string()));
        assert!(!ws_still_open(&broken));
    }

    #[test_log::test]
    fn test_extract_images_plain() {
        let outputs = json!({
            "9": {
                "images": [
                    {"filename": "ComfyUI_00001_.png", "subfolder": "", "type": "output"},
                    {"filename": "ComfyUI_00002_.png", "subfolder": "", "type": "output"},
                ],
            },
        });
        let images = extract_images(&outputs).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].filename, "ComfyUI_00001_.png");
        assert_eq!(images[1].kind, "output");
    }

    #[test]
    fn test_extract_images_result_wrapped() {
        let outputs = json!({
            "12": {
                "result": [[{"filename": "wrapped.png", "subfolder": "batch", "type": "output"}]],
            },
        });
        let images = extract_images(&outputs).unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].filename, "wrapped.png");
        assert_eq!(images[0].subfolder, "batch");
    }

    #[test_log::test]
    fn test_extract_images_skips_non_image_nodes() {
        let outputs = json!({
            "3": {"latents": [{"filename": "x.latent"}]},
            "9": {"images": [{"filename": "ok.png"}]},
        });
        let images = extract_images(&outputs).unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].filename, "ok.png");
        assert_eq!(images[0].subfolder, "");
    }

    #[test]
    fn test_extract_images_rejects_non_mapping() {
        assert!(extract_images(&json!([1, 2])).is_err());
    }
}
