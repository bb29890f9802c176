use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::logger::{resolve_log_format, sink_schema_properties, AsyncLogger, LogFormat, LogSink, LoggerLayer, SinkOptions};
use super::{decode_config, BoxHandler, Plugin};
use crate::core::error::{GatewayError, GatewayResult};
use crate::store::ConfigStore;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileLoggerConfig {
    pub path: PathBuf,
    #[serde(flatten)]
    pub sink: SinkOptions,
}

/// Appends one JSON line per request to a file
#[derive(Debug)]
pub struct FileLogger {
    store: Arc<ConfigStore>,
    config: FileLoggerConfig,
    format: Arc<LogFormat>,
    logger: Option<Arc<AsyncLogger>>,
}

impl FileLogger {
    pub const NAME: &'static str = "file-logger";
    pub const PRIORITY: i64 = 399;

    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self {
            store,
            config: FileLoggerConfig::default(),
            format: Arc::new(LogFormat::new()),
            logger: None,
        }
    }
}

impl Plugin for FileLogger {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn priority(&self) -> i64 {
        Self::PRIORITY
    }

    fn schema(&self) -> Value {
        let mut properties = sink_schema_properties();
        properties.insert("path".to_string(), json!({"type": "string", "minLength": 1}));
        json!({
            "type": "object",
            "properties": properties,
            "required": ["path"]
        })
    }

    fn configure(&mut self, raw: Value) -> GatewayResult<()> {
        self.config = decode_config(Self::NAME, raw)?;
        Ok(())
    }

    fn post_init(&mut self) -> GatewayResult<()> {
        self.format = Arc::new(resolve_log_format(
            self.config.sink.log_format.as_ref(),
            &self.store,
            Self::NAME,
        ));

        let sink = FileSink {
            path: self.config.path.clone(),
            file: Mutex::new(None),
        };
        self.logger = Some(Arc::new(AsyncLogger::spawn(
            Self::NAME,
            sink,
            self.config.sink.buffer_size,
            self.config.sink.policy,
        )?));
        Ok(())
    }

    fn handler(self: Arc<Self>, next: BoxHandler) -> BoxHandler {
        match &self.logger {
            Some(logger) => Arc::new(LoggerLayer {
                logger: Arc::clone(logger),
                format: Arc::clone(&self.format),
                next,
            }),
            // never initialised, behave as a pass-through
            None => next,
        }
    }
}

struct FileSink {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

#[async_trait]
impl LogSink for FileSink {
    async fn write(&self, entry: &Value) -> GatewayResult<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        if file.is_none() {
            let opened = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| {
                    GatewayError::plugin(
                        FileLogger::NAME,
                        format!("failed to open {}: {}", self.path.display(), e),
                    )
                })?;
            *file = Some(opened);
        }

        if let Some(handle) = file.as_mut() {
            if let Err(e) = handle.write_all(&line).await {
                // reopen on the next entry, the file may have been rotated away
                *file = None;
                return Err(e.into());
            }
            handle.flush().await?;
        }
        Ok(())
    }
}
