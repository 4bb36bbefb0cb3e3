//! Plugin directory watcher

use crate::discovery::PluginDiscovery;
use crate::error::{PluginRuntimeError, Result};
use crate::options::PluginOptions;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use plexus_store::PluginRecord;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Registers module files as they appear in the plugin directory
///
/// Each module file that is created or rewritten is inspected and recorded
/// through [`PluginDiscovery::register_from_path`]. Newly recorded plugins
/// are sent on the channel returned by [`DirectoryWatcher::start`]; loading
/// them is left to the receiver.
#[derive(Debug)]
pub struct DirectoryWatcher {
    discovery: Arc<PluginDiscovery>,
    debounce: Duration,
    watcher: Option<RecommendedWatcher>,
    task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl DirectoryWatcher {
    /// Create a watcher for the discovery service's directory
    pub fn new(discovery: Arc<PluginDiscovery>) -> Self {
        Self {
            discovery,
            debounce: Duration::from_millis(500),
            watcher: None,
            task: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Ignore repeated events for the same file within `duration`
    pub fn with_debounce(mut self, duration: Duration) -> Self {
        self.debounce = duration;
        self
    }

    /// Whether the watcher is running
    pub fn is_running(&self) -> bool {
        self.watcher.is_some()
    }

    /// Start watching
    pub async fn start(&mut self) -> Result<mpsc::UnboundedReceiver<PluginRecord>> {
        if self.is_running() {
            return Err(PluginRuntimeError::invalid_state("watcher already running"));
        }

        let options = self.discovery.options().clone();
        tokio::fs::create_dir_all(&options.directory).await?;

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = event_tx.send(res);
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(|e| PluginRuntimeError::other(format!("Failed to create file watcher: {e}")))?;

        let mode = if options.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher
            .watch(&options.directory, mode)
            .map_err(|e| PluginRuntimeError::other(format!("Failed to watch directory: {e}")))?;

        let (record_tx, record_rx) = mpsc::unbounded_channel();
        let discovery = Arc::clone(&self.discovery);
        let directory = options.directory.clone();
        let mut debouncer = Debouncer::new(self.debounce);
        self.cancel = CancellationToken::new();
        let cancel = self.cancel.clone();

        let task = tokio::spawn(async move {
            loop {
                let res = tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = event_rx.recv() => match res {
                        Some(res) => res,
                        None => break,
                    },
                };

                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "File watcher error");
                        continue;
                    }
                };

                for path in module_paths(&event, &options) {
                    if !debouncer.admit(&path, Instant::now()) {
                        continue;
                    }

                    debug!(path = %path.display(), "Module file changed");
                    match discovery.register_from_path(&path, &cancel).await {
                        Ok(record) => {
                            if record_tx.send(record).is_err() {
                                debug!("Watcher receiver dropped");
                            }
                        }
                        Err(e) => {
                            error!(path = %path.display(), error = %e, "Failed to register module")
                        }
                    }
                }
            }
            debug!("Watcher loop exited");
        });

        self.watcher = Some(watcher);
        self.task = Some(task);
        info!(directory = %directory.display(), "Plugin directory watcher started");
        Ok(record_rx)
    }

    /// Stop watching and wait for the event loop to exit
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        self.watcher = None;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Watcher loop terminated abnormally");
            }
        }
        info!("Plugin directory watcher stopped");
    }
}

/// Drops repeated events for the same path inside a time window
///
/// Entries older than the window are pruned on every call, so the map only
/// holds paths seen within the last window.
#[derive(Debug)]
struct Debouncer {
    window: Duration,
    last_seen: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last_seen: HashMap::new(),
        }
    }

    /// Whether an event for `path` at `now` should be handled
    fn admit(&mut self, path: &Path, now: Instant) -> bool {
        let window = self.window;
        self.last_seen
            .retain(|_, seen| now.saturating_duration_since(*seen) < window);

        if self.last_seen.contains_key(path) {
            return false;
        }
        self.last_seen.insert(path.to_path_buf(), now);
        true
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.last_seen.len()
    }
}

/// Module files touched by a create or modify event
fn module_paths(event: &Event, options: &PluginOptions) -> Vec<PathBuf> {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return Vec::new();
    }
    event
        .paths
        .iter()
        .filter(|path| options.is_module_file(path))
        .cloned()
        .collect()
}
