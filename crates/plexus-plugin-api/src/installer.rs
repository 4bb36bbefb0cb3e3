//! First-time installation capability

use crate::error::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Capability for plugins that need one-time setup
///
/// The host asks [`is_installed`](Self::is_installed) after every load and
/// runs [`install`](Self::install) when it answers `false`. `uninstall` only
/// runs when an operator uninstalls the plugin.
#[async_trait]
pub trait PluginInstaller: Send + Sync {
    /// Whether setup already happened
    async fn is_installed(&self, cancel: CancellationToken) -> Result<bool>;

    /// Create schemas, files or other resources the plugin needs
    ///
    /// Returns `false` when setup did not complete.
    async fn install(&self, cancel: CancellationToken) -> Result<bool>;

    /// Remove what [`install`](Self::install) created
    ///
    /// Returns `false` when there was nothing to remove.
    async fn uninstall(&self, cancel: CancellationToken) -> Result<bool>;
}
