// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::adapter::Adapter;
use crate::config::{encode_name, validate_ring_capacity, AdapterConfig};
use crate::dll::Driver;
#[cfg(windows)]
use crate::dll::{DllSource, NativeDriver};
use crate::error::{Error, Result};
use crate::logger::{self, LogSink};

static LOADED: RwLock<Option<Wintun>> = RwLock::new(None);

/// A loaded Wintun library.
///
/// Clones share the same library, which stays mapped until every clone and every [`Adapter`]
/// (and packet) created through it has been dropped.
#[derive(Clone)]
pub struct Wintun {
    driver: Arc<dyn Driver>,
}

impl Wintun {
    /// Loads `wintun.dll` from `source` and resolves its entry points.
    ///
    /// # Errors
    ///
    /// Fails with the OS error if the library cannot be loaded, or with
    /// [`Error::MissingSymbol`] if it lacks one of the Wintun functions.
    #[cfg(windows)]
    pub fn load<S: Into<DllSource>>(source: S) -> Result<Self> {
        let source = source.into();
        match &source {
            DllSource::Path(path) => log::info!("loading wintun from {}", path.display()),
            DllSource::Memory(image) => {
                log::info!("loading wintun from {} byte in-memory image", image.len())
            }
        }

        let driver = NativeDriver::load(&source)?;
        Ok(Self::from_driver(Arc::new(driver)))
    }

    /// Uses the Wintun functions linked into the executable at load time.
    #[cfg(all(windows, feature = "link"))]
    pub fn linked() -> Self {
        Self::from_driver(Arc::new(NativeDriver::linked()))
    }

    pub(crate) fn from_driver(driver: Arc<dyn Driver>) -> Self {
        Self { driver }
    }

    /// Returns the version of the running Wintun driver.
    ///
    /// Fails with `ERROR_FILE_NOT_FOUND` if the driver is not loaded, which is the case until
    /// the first adapter has been created.
    pub fn driver_version(&self) -> Result<u32> {
        Ok(self.driver.driver_version()?)
    }

    /// Removes the Wintun driver from the system if no adapters are in use.
    pub fn delete_driver(&self) -> Result<()> {
        self.driver.delete_driver()?;
        log::info!("deleted wintun driver");
        Ok(())
    }

    /// Creates a new adapter named `name`.
    ///
    /// Unless disabled through [`AdapterConfig::start_session`], a session with the configured
    /// ring capacity is started on the new adapter. The adapter is closed again if the session
    /// cannot be started.
    pub fn create_adapter(&self, name: &str, config: &AdapterConfig) -> Result<Adapter> {
        if config.start_session {
            validate_ring_capacity(config.ring_capacity)?;
        }
        let wide_name = encode_name(name)?;
        let wide_type = encode_name(&config.tunnel_type)?;

        let raw = self
            .driver
            .create_adapter(&wide_name, &wide_type, config.guid.as_ref())?;
        log::debug!(
            "created adapter {} (tunnel type {})",
            name,
            config.tunnel_type
        );

        let adapter = Adapter::new(self.driver.clone(), name, raw);
        if config.start_session {
            // Dropping the adapter on failure closes it.
            adapter.start(config.ring_capacity)?;
        }

        Ok(adapter)
    }

    /// Opens the existing adapter named `name`. No session is started.
    pub fn open_adapter(&self, name: &str) -> Result<Adapter> {
        let wide_name = encode_name(name)?;
        let raw = self.driver.open_adapter(&wide_name)?;
        log::debug!("opened adapter {}", name);

        Ok(Adapter::new(self.driver.clone(), name, raw))
    }

    /// Sets the process-wide sink for the driver's diagnostic messages, or disables driver
    /// logging when `None`.
    ///
    /// Wintun supports a single logger per process; the sink replaces any set before, including
    /// one set through a different `Wintun`.
    pub fn set_logger(&self, sink: Option<LogSink>) {
        let callback = logger::replace_sink(sink);
        unsafe {
            self.driver.set_logger(callback);
        }
    }
}

impl fmt::Debug for Wintun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wintun").finish_non_exhaustive()
    }
}

/// Loads the process-wide Wintun library from `source`.
///
/// # Errors
///
/// Fails with [`Error::AlreadyLoaded`] if a library is already loaded, or with any error from
/// [`Wintun::load`].
#[cfg(windows)]
pub fn load<S: Into<DllSource>>(source: S) -> Result<Wintun> {
    let mut loaded = LOADED.write().unwrap_or_else(PoisonError::into_inner);
    if loaded.is_some() {
        return Err(Error::AlreadyLoaded);
    }

    let wintun = Wintun::load(source)?;
    *loaded = Some(wintun.clone());
    Ok(wintun)
}

/// Releases the process-wide Wintun library.
///
/// The library is unloaded once adapters created through it have been dropped as well.
pub fn release() -> Result<()> {
    let wintun = LOADED
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
        .ok_or(Error::NotLoaded)?;
    log::debug!("released process-wide wintun library");
    drop(wintun);
    Ok(())
}

/// Returns the process-wide Wintun library.
pub fn global() -> Result<Wintun> {
    LOADED
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .ok_or(Error::NotLoaded)
}

#[cfg(test)]
pub(crate) fn install(wintun: Wintun) -> Result<()> {
    let mut loaded = LOADED.write().unwrap_or_else(PoisonError::into_inner);
    if loaded.is_some() {
        return Err(Error::AlreadyLoaded);
    }
    *loaded = Some(wintun);
    Ok(())
}
