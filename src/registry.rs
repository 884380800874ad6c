//! Camera id -> running recorder.
//!
//! Stopping a recorder can take up to its stop timeout, so every blocking
//! call happens after the recorder was taken out of the map.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};

use crate::config::CameraConfig;
use crate::recorder::{Recorder, RecorderDeps, RecorderStatus};

pub struct RecorderRegistry {
    deps: RecorderDeps,
    recorders: Mutex<HashMap<String, Recorder>>,
}

impl RecorderRegistry {
    pub fn new(deps: RecorderDeps) -> Self {
        Self {
            deps,
            recorders: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Recorder>>> {
        self.recorders
            .lock()
            .map_err(|_| anyhow!("recorder registry lock poisoned"))
    }

    /// Start a recorder for `config`, replacing any instance with the same id.
    pub fn start(&self, config: CameraConfig) -> Result<()> {
        let mut recorder = Recorder::new(config, self.deps.clone())?;
        let id = recorder.id().to_string();
        let previous = self.lock()?.remove(&id);
        if let Some(mut previous) = previous {
            log::info!("{}: replacing running recorder", id);
            previous.stop();
        }
        recorder.start()?;
        // A concurrent start for the same id may have won the race.
        let replaced = self.lock()?.insert(id.clone(), recorder);
        if let Some(mut replaced) = replaced {
            log::info!("{}: replacing recorder started concurrently", id);
            replaced.stop();
        }
        Ok(())
    }

    /// Stop a recorder but keep it registered. Returns false for unknown ids.
    pub fn stop(&self, id: &str) -> Result<bool> {
        let Some(mut recorder) = self.lock()?.remove(id) else {
            return Ok(false);
        };
        recorder.stop();
        self.lock()?.entry(id.to_string()).or_insert(recorder);
        Ok(true)
    }

    /// Stop and forget a recorder. Returns false for unknown ids.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let Some(mut recorder) = self.lock()?.remove(id) else {
            return Ok(false);
        };
        recorder.stop();
        Ok(true)
    }

    pub fn status(&self, id: &str) -> Option<RecorderStatus> {
        self.lock().ok()?.get(id).map(Recorder::status)
    }

    /// Every registered recorder, sorted by camera id.
    pub fn statuses(&self) -> Vec<RecorderStatus> {
        let Ok(recorders) = self.lock() else {
            return Vec::new();
        };
        let mut statuses: Vec<RecorderStatus> = recorders.values().map(Recorder::status).collect();
        statuses.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
        statuses
    }

    pub fn latest_frame(&self, id: &str) -> Option<Arc<Vec<u8>>> {
        self.lock().ok()?.get(id).and_then(Recorder::latest_frame)
    }

    pub fn len(&self) -> usize {
        self.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every recorder in parallel and clear the registry.
    pub fn stop_all(&self) {
        let drained: Vec<Recorder> = match self.lock() {
            Ok(mut recorders) => recorders.drain().map(|(_, r)| r).collect(),
            Err(_) => return,
        };
        let handles: Vec<_> = drained
            .into_iter()
            .map(|mut recorder| {
                std::thread::spawn(move || {
                    recorder.stop();
                })
            })
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for RecorderRegistry {
    fn drop(&mut self) {
        self.stop_all();
    }
}
