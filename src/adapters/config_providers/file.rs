use std::path::{Path, PathBuf};

use async_trait::async_trait;
use eyre::{Context, Result};
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::{
    config::{loader::load_config, models::AgentConfig},
    ports::config_provider::ConfigProvider,
};

/// Configuration provider that loads from a local file and watches it for changes.
///
/// The parent directory is watched rather than the file, so editors that replace
/// the file on save are still picked up.
pub struct FileConfigProvider {
    path: PathBuf,
    _watcher: Option<notify::RecommendedWatcher>,
    update_tx: mpsc::Sender<()>,
    update_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (tx, rx) = mpsc::channel(1);

        let mut provider = Self {
            path,
            _watcher: None,
            update_tx: tx,
            update_rx: std::sync::Mutex::new(Some(rx)),
        };

        provider.init_watcher()?;
        Ok(provider)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init_watcher(&mut self) -> Result<()> {
        let tx = self.update_tx.clone();
        let config_filename = self
            .path
            .file_name()
            .ok_or_else(|| eyre::eyre!("Invalid config path: {}", self.path.display()))?
            .to_owned();

        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        let relevant = event.kind.is_modify()
                            || event.kind.is_create()
                            || event.kind.is_remove();
                        if relevant
                            && event
                                .paths
                                .iter()
                                .any(|p| p.file_name() == Some(&config_filename))
                        {
                            tracing::debug!("Config file changed: {:?}", event.kind);
                            // A pending signal already covers this change.
                            let _ = tx.try_send(());
                        }
                    }
                    Err(e) => tracing::error!("File watch error: {:?}", e),
                }
            })?;

        let watch_dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        watcher
            .watch(watch_dir, RecursiveMode::NonRecursive)
            .wrap_err("Failed to watch config directory")?;

        self._watcher = Some(watcher);
        Ok(())
    }
}

#[async_trait]
impl ConfigProvider for FileConfigProvider {
    async fn load_config(&self) -> Result<AgentConfig> {
        load_config(Some(self.path.as_path())).await
    }

    fn watch(&self) -> mpsc::Receiver<()> {
        let taken = self
            .update_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        taken.unwrap_or_else(|| {
            tracing::warn!("Config watch channel already taken; returning a closed channel");
            mpsc::channel(1).1
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::Write};

    use tempfile::tempdir;
    use tokio::time::{Duration, sleep};

    use super::*;

    const INITIAL: &str = r#"
        listen_addr = "127.0.0.1:8080"

        [[functions]]
        name = "hello"
        uid = "uid-hello"
    "#;

    const UPDATED: &str = r#"
        listen_addr = "127.0.0.1:8080"

        [[functions]]
        name = "hello"
        uid = "uid-hello"

        [[triggers]]
        name = "hello-route"
        relative_url = "/hello"
        function = { type = "name", name = "hello" }
    "#;

    #[tokio::test]
    async fn test_file_config_provider() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("fnagent.toml");
        File::create(&file_path)?.write_all(INITIAL.as_bytes())?;

        let provider = FileConfigProvider::new(&file_path)?;
        let config = provider.load_config().await?;
        assert_eq!(config.functions.len(), 1);
        assert!(config.triggers.is_empty());

        let mut rx = provider.watch();

        sleep(Duration::from_millis(100)).await;
        File::create(&file_path)?.write_all(UPDATED.as_bytes())?;

        let notification = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(notification.is_ok(), "Timed out waiting for config update");
        assert!(
            notification.unwrap().is_some(),
            "Channel closed unexpectedly"
        );

        let config = provider.load_config().await?;
        assert_eq!(config.triggers.len(), 1);
        assert_eq!(config.triggers[0].relative_url.as_deref(), Some("/hello"));
        Ok(())
    }

    #[tokio::test]
    async fn test_second_watch_is_closed() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("fnagent.toml");
        File::create(&file_path)?.write_all(INITIAL.as_bytes())?;

        let provider = FileConfigProvider::new(&file_path)?;
        let _first = provider.watch();
        let mut second = provider.watch();
        assert!(second.recv().await.is_none());
        Ok(())
    }
}
