//! TCP inference server
//!
//! Each connection is served by its own task. Requests on one connection are
//! answered in order; errors become error records and the connection stays open.

use arena_bridge::{LineReader, LineWriter, RecordReader, RecordWriter};
use arena_core::config::InferenceConfig;
use arena_core::{Policy, Sampling};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::cache::{LoadedModel, ModelCache, load_model, resolve_model};
use crate::error::InferError;
use crate::protocol::{InferRequest, InferResponse, encode_response, parse_request};

/// Shared model cache plus the fallback sampling seed
pub struct InferenceServer {
    models_dir: PathBuf,
    cache: Mutex<ModelCache>,
    default_seed: u64,
}

impl InferenceServer {
    pub fn new(config: &InferenceConfig) -> Self {
        Self {
            models_dir: config.models_dir.clone(),
            cache: Mutex::new(ModelCache::new(
                config.models_dir.clone(),
                config.max_loaded_models,
            )),
            default_seed: config.default_seed,
        }
    }

    /// Resolve and load off the runtime; the cache lock is only held to look up and insert
    async fn model(&self, name: &str) -> Result<Arc<LoadedModel>, InferError> {
        let dir = self.models_dir.clone();
        let requested = name.to_string();
        let stem = blocking(move || resolve_model(&dir, &requested)).await?;
        if let Some(model) = self.cache.lock().await.touch(&stem) {
            return Ok(model);
        }

        let dir = self.models_dir.clone();
        let loaded = blocking(move || load_model(&dir, &stem)).await?;
        Ok(self.cache.lock().await.insert(Arc::new(loaded)))
    }

    /// Answer one request
    pub async fn predict(&self, request: &InferRequest) -> Result<InferResponse, InferError> {
        let model = self.model(&request.model).await?;

        let output = if request.deterministic {
            model
                .policy
                .act(&request.observation, &request.action_masks, Sampling::Deterministic)?
        } else {
            let mut rng = ChaCha8Rng::seed_from_u64(request.seed.unwrap_or(self.default_seed));
            model.policy.act(
                &request.observation,
                &request.action_masks,
                Sampling::Stochastic(&mut rng),
            )?
        };

        Ok(InferResponse::Action {
            action: output.action,
            value: if request.return_value {
                output.value
            } else {
                None
            },
        })
    }

    pub async fn unload(&self, name: &str) -> bool {
        self.cache.lock().await.unload(name)
    }

    pub async fn loaded(&self) -> Vec<String> {
        self.cache.lock().await.loaded()
    }

    /// Decode, answer and encode one request line
    pub async fn handle_line(&self, line: &[u8]) -> Vec<u8> {
        let response = match parse_request(line) {
            Ok(request) => match self.predict(&request).await {
                Ok(response) => response,
                Err(e) => {
                    warn!("Inference for {} failed: {}", request.model, e);
                    InferResponse::error(&e)
                }
            },
            Err(e) => {
                warn!("Rejected inference request: {}", e);
                InferResponse::error(&e)
            }
        };
        encode_response(&response)
    }

    /// Accept connections until `shutdown` flips to true
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("Inference server listening on {}", addr);
        }
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!("Inference client connected: {}", peer);
                    let server = self.clone();
                    let conn_shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        server.serve_connection(stream, conn_shutdown).await;
                        debug!("Inference client disconnected: {}", peer);
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Inference server stopped");
        Ok(())
    }

    async fn serve_connection(&self, stream: TcpStream, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {}", e);
        }
        let (read_half, write_half) = stream.into_split();
        let mut reader = LineReader::new(read_half);
        let mut writer = LineWriter::new(write_half);

        loop {
            let record = tokio::select! {
                record = reader.read_record() => record,
                _ = shutdown.changed() => break,
            };
            let line = match record {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("Inference connection read failed: {}", e);
                    break;
                }
            };
            let response = self.handle_line(&line).await;
            if let Err(e) = writer.write_record(&response).await {
                error!("Failed to write inference response: {}", e);
                break;
            }
        }
        let _ = writer.shutdown().await;
    }
}

async fn blocking<T, F>(f: F) -> Result<T, InferError>
where
    F: FnOnce() -> Result<T, InferError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .unwrap_or_else(|e| Err(InferError::Loader(e.to_string())))
}

/// Bind `address` and serve until `shutdown` flips to true
pub async fn run(
    config: &InferenceConfig,
    address: &str,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(address).await?;
    Arc::new(InferenceServer::new(config))
        .serve(listener, shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::write_snapshot;
    use arena_core::{Action, ActionMasks};

    fn server(dir: &std::path::Path) -> InferenceServer {
        InferenceServer::new(&InferenceConfig {
            models_dir: dir.to_path_buf(),
            max_loaded_models: 2,
            default_seed: 11,
        })
    }

    #[tokio::test]
    async fn test_deterministic_masked_argmax() {
        let dir = tempfile::tempdir().unwrap();
        write_snapshot(dir.path(), 1, [0.0, 0.0, 0.0]);
        let server = server(dir.path());

        // logits = [1.0, 0.0, 0.5]
        let mut req = InferRequest::new("latest", vec![1.0, 0.0]);
        req.return_value = true;
        let resp = server.predict(&req).await.unwrap();
        assert_eq!(
            resp,
            InferResponse::Action {
                action: Action::new(vec![0]),
                value: Some(1.0),
            }
        );

        req.action_masks = ActionMasks::new(vec![vec![false, true, true]]);
        req.return_value = false;
        let resp = server.predict(&req).await.unwrap();
        assert_eq!(
            resp,
            InferResponse::Action {
                action: Action::new(vec![2]),
                value: None,
            }
        );
    }

    #[tokio::test]
    async fn test_fixed_seed_is_reproducible() {
        let dir = tempfile::tempdir().unwrap();
        write_snapshot(dir.path(), 1, [0.0, 0.0, 0.0]);
        let server = server(dir.path());

        let mut req = InferRequest::new("snapshot_000001", vec![0.2, 0.3]);
        req.deterministic = false;
        req.seed = Some(42);
        let first = server.predict(&req).await.unwrap();
        for _ in 0..5 {
            assert_eq!(server.predict(&req).await.unwrap(), first);
        }

        // Without a request seed the server seed is used
        req.seed = None;
        let a = server.predict(&req).await.unwrap();
        let b = server.predict(&req).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_error_records_keep_serving() {
        let dir = tempfile::tempdir().unwrap();
        write_snapshot(dir.path(), 1, [0.0, 0.0, 0.0]);
        let server = server(dir.path());

        let resp = server
            .handle_line(br#"{"model":"snapshot_000099","observation":[1.0,0.0]}"#)
            .await;
        let json: serde_json::Value = serde_json::from_slice(&resp).unwrap();
        assert_eq!(json["error"]["kind"], "unknown_model");

        let resp = server.handle_line(b"not json").await;
        let json: serde_json::Value = serde_json::from_slice(&resp).unwrap();
        assert_eq!(json["error"]["kind"], "bad_request");

        let resp = server
            .handle_line(br#"{"model":"snapshot_000001","observation":[1.0]}"#)
            .await;
        let json: serde_json::Value = serde_json::from_slice(&resp).unwrap();
        assert_eq!(json["error"]["kind"], "policy");

        let resp = server
            .handle_line(br#"{"model":"snapshot_000001","observation":[1.0,0.0]}"#)
            .await;
        let json: serde_json::Value = serde_json::from_slice(&resp).unwrap();
        assert_eq!(json["action"], serde_json::json!([0]));
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_entry() {
        let dir = tempfile::tempdir().unwrap();
        write_snapshot(dir.path(), 1, [0.0, 0.0, 0.0]);
        write_snapshot(dir.path(), 2, [0.0, 0.0, 0.0]);
        let server = server(dir.path());

        let req = InferRequest::new("snapshot_000001", vec![1.0, 0.0]);
        let other = InferRequest::new("snapshot_000002", vec![1.0, 0.0]);
        let (a, b, c) = tokio::join!(
            server.predict(&req),
            server.predict(&req),
            server.predict(&other)
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert!(!c.unwrap().is_error());

        let mut loaded = server.loaded().await;
        loaded.sort();
        assert_eq!(loaded, vec!["snapshot_000001", "snapshot_000002"]);
    }

    #[tokio::test]
    async fn test_unload() {
        let dir = tempfile::tempdir().unwrap();
        write_snapshot(dir.path(), 1, [0.0, 0.0, 0.0]);
        let server = server(dir.path());

        server
            .predict(&InferRequest::new("latest", vec![0.0, 0.0]))
            .await
            .unwrap();
        assert_eq!(server.loaded().await, vec!["snapshot_000001"]);
        assert!(server.unload("snapshot_000001").await);
        assert!(server.loaded().await.is_empty());
    }
}
