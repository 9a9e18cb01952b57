//! Provides the depot services and a way to initialize them.
//!
//! The main [`create_services`] fn creates all services according to the provided [`Config`].

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::caching::Caches;
use crate::config::Config;
use crate::download::DownloadService;

pub mod images;
pub mod remote;

pub use images::ImageService;
pub use remote::RemoteFileService;

/// All services, shared by the endpoints.
#[derive(Debug, Clone)]
pub struct SharedServices {
    pub remote: RemoteFileService,
    pub images: ImageService,
}

/// Creates all services, clearing leftover temporary files first.
pub fn create_services(config: &Config) -> Result<SharedServices> {
    let caches = Caches::from_config(config).context("failed to create local caches")?;
    caches.clear_tmp().context("failed to clear tmp caches")?;

    let downloader =
        Arc::new(DownloadService::new(config).context("failed to create the HTTP client")?);

    let Caches { remote, derived } = caches;
    let remote = RemoteFileService::new(
        remote,
        downloader,
        config.origins.clone(),
        config.wait_timeout,
    );
    let images = ImageService::new(derived, &config.images, config.wait_timeout);

    Ok(SharedServices { remote, images })
}
