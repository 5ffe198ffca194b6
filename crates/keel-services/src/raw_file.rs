//! RawFile service: a stateful servant confined to one open file handle.
//!
//! The handle is the held resource: it is opened on request, dropped on
//! passivate (and reopened on activate), and released for good by the close
//! pass. Paths resolve under a fixed root and may not escape it.

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, OnceLock};

use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    parse_args, MethodTable, ServiceError, ServiceInterface, ServiceResult, StatefulService,
};

/// Largest single read.
pub const MAX_READ_BYTES: u64 = 1024 * 1024;

struct OpenFile {
    path: PathBuf,
    /// `None` while passivated.
    file: Option<File>,
    size: u64,
}

pub struct RawFileService {
    root: PathBuf,
    state: Mutex<Option<OpenFile>>,
}

impl RawFileService {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            state: Mutex::new(None),
        }
    }

    /// Resolve `path` under the root, rejecting anything that climbs out.
    fn resolve_path(&self, path: &str) -> ServiceResult<PathBuf> {
        let relative = Path::new(path);
        if relative.is_absolute() {
            return Err(ServiceError::Security(format!("Absolute paths are not allowed: {path}")));
        }
        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(ServiceError::Security(format!("Path escapes the file root: {path}")));
                }
            }
        }
        Ok(resolved)
    }

    async fn open(&self, args: Value) -> ServiceResult<Value> {
        let p: OpenParams = parse_args(args)?;
        let path = self.resolve_path(&p.path)?;
        let file = File::open(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ServiceError::NotFound(format!("No such file: {}", p.path)),
            _ => ServiceError::Io(e),
        })?;
        let size = file.metadata().await?.len();

        let mut state = self.state.lock().await;
        if let Some(previous) = state.as_ref() {
            return Err(ServiceError::Validation(format!(
                "A file is already open: {}",
                previous.path.display()
            )));
        }
        debug!("RawFile opened {}", path.display());
        *state = Some(OpenFile {
            path,
            file: Some(file),
            size,
        });
        Ok(json!({ "size": size }))
    }

    async fn read(&self, args: Value) -> ServiceResult<Value> {
        let p: ReadParams = parse_args(args)?;
        if p.length > MAX_READ_BYTES {
            return Err(ServiceError::Validation(format!(
                "Read length {} exceeds {MAX_READ_BYTES}",
                p.length
            )));
        }

        let mut state = self.state.lock().await;
        let open = state
            .as_mut()
            .ok_or_else(|| ServiceError::Validation("No file is open".into()))?;
        if p.offset >= open.size {
            return Ok(json!({ "data": "", "length": 0 }));
        }
        let file = open
            .file
            .as_mut()
            .ok_or_else(|| ServiceError::Validation("Service is passivated".into()))?;

        let length = p.length.min(open.size - p.offset) as usize;
        let mut buf = vec![0u8; length];
        file.seek(SeekFrom::Start(p.offset)).await?;
        file.read_exact(&mut buf).await?;

        Ok(json!({
            "data": base64::engine::general_purpose::STANDARD.encode(&buf),
            "length": length,
        }))
    }

    async fn size(&self) -> ServiceResult<Value> {
        let state = self.state.lock().await;
        let open = state
            .as_ref()
            .ok_or_else(|| ServiceError::Validation("No file is open".into()))?;
        Ok(json!({ "size": open.size }))
    }

    /// Whether a handle is currently held.
    pub async fn holds_handle(&self) -> bool {
        matches!(self.state.lock().await.as_ref(), Some(OpenFile { file: Some(_), .. }))
    }
}

impl ServiceInterface for RawFileService {
    const INTERFACE: &'static str = "RawFile";

    fn method_table() -> &'static MethodTable<Self> {
        static TABLE: OnceLock<MethodTable<RawFileService>> = OnceLock::new();
        TABLE.get_or_init(|| {
            MethodTable::new(Self::INTERFACE)
                .method("open", |svc: Arc<Self>, args| async move { svc.open(args).await })
                .method("read", |svc: Arc<Self>, args| async move { svc.read(args).await })
                .method("size", |svc: Arc<Self>, _args| async move { svc.size().await })
        })
    }
}

impl StatefulService for RawFileService {
    async fn activate(&self) -> ServiceResult<()> {
        let mut state = self.state.lock().await;
        if let Some(open) = state.as_mut() {
            if open.file.is_none() {
                open.file = Some(File::open(&open.path).await?);
                debug!("RawFile reactivated {}", open.path.display());
            }
        }
        Ok(())
    }

    async fn passivate(&self) -> ServiceResult<()> {
        if let Some(open) = self.state.lock().await.as_mut() {
            open.file = None;
            debug!("RawFile passivated {}", open.path.display());
        }
        Ok(())
    }

    async fn close(&self) -> ServiceResult<()> {
        let mut state = self.state.lock().await;
        if let Some(open) = state.as_mut() {
            open.file = None;
            info!("RawFile closed {}", open.path.display());
        }
        Ok(())
    }

    async fn post_close(&self) {
        self.state.lock().await.take();
    }
}

#[derive(Deserialize)]
struct OpenParams {
    path: String,
}

#[derive(Deserialize)]
struct ReadParams {
    #[serde(default)]
    offset: u64,
    length: u64,
}
