// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Run-time dynamic linking of the Wintun library.

use std::fs::{self, OpenOptions};
use std::hash::{BuildHasher, Hasher, RandomState};
use std::io::{self, Write};
use std::os::windows::ffi::OsStrExt;
use std::os::windows::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use std::{env, iter, mem, process, ptr};

use windows_sys::Win32::Foundation::{FreeLibrary, HMODULE};
use windows_sys::Win32::System::LibraryLoader::{
    GetProcAddress, LoadLibraryExW, LOAD_LIBRARY_SEARCH_APPLICATION_DIR,
    LOAD_LIBRARY_SEARCH_SYSTEM32, LOAD_WITH_ALTERED_SEARCH_PATH,
};
use windows_sys::Win32::Storage::FileSystem::FILE_SHARE_READ;

use super::api::{NativeDriver, WintunApi};
use super::DllSource;
use crate::error::{Error, Result};

static EXTRACT_ID: AtomicUsize = AtomicUsize::new(0);

/// A loaded `wintun.dll` module, freed on drop.
pub(crate) struct Module {
    handle: HMODULE,
    /// Directory the image was written to when loaded from memory.
    extracted: Option<PathBuf>,
}

impl Module {
    fn load_path(path: &Path) -> io::Result<HMODULE> {
        let wide: Vec<u16> = path.as_os_str().encode_wide().chain(iter::once(0)).collect();

        // Bare file names must not be picked up from the current directory.
        let flags = if path.parent().map_or(true, |p| p.as_os_str().is_empty()) {
            LOAD_LIBRARY_SEARCH_APPLICATION_DIR | LOAD_LIBRARY_SEARCH_SYSTEM32
        } else {
            LOAD_WITH_ALTERED_SEARCH_PATH
        };

        let handle = unsafe { LoadLibraryExW(wide.as_ptr(), ptr::null_mut(), flags) };
        if handle.is_null() {
            Err(io::Error::last_os_error())
        } else {
            Ok(handle)
        }
    }

    fn open(source: &DllSource) -> io::Result<Self> {
        match source {
            DllSource::Path(path) => Ok(Self {
                handle: Self::load_path(path)?,
                extracted: None,
            }),
            DllSource::Memory(image) => {
                let dir = Self::create_private_dir()?;
                let path = dir.join("wintun.dll");
                match Self::load_image(&path, image) {
                    Ok(handle) => {
                        log::debug!("extracted wintun image to {}", path.display());
                        Ok(Self {
                            handle,
                            extracted: Some(dir),
                        })
                    }
                    Err(e) => {
                        let _ = fs::remove_dir_all(&dir);
                        Err(e)
                    }
                }
            }
        }
    }

    /// Creates a fresh directory with an unpredictable name under the temp directory.
    ///
    /// The directory must not exist beforehand, so nothing can be planted in it ahead of time.
    fn create_private_dir() -> io::Result<PathBuf> {
        let base = env::temp_dir();
        let mut attempts = 0;

        loop {
            let mut hasher = RandomState::new().build_hasher();
            hasher.write_u32(process::id());
            hasher.write_usize(EXTRACT_ID.fetch_add(1, Ordering::Relaxed));
            hasher.write_u128(
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map_or(0, |d| d.as_nanos()),
            );

            let dir = base.join(format!("wintun-{:016x}", hasher.finish()));
            match fs::create_dir(&dir) {
                Ok(()) => return Ok(dir),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempts < 8 => {
                    attempts += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes `image` to the new file `path` and loads it.
    ///
    /// The file is kept open without write or delete sharing until the library is mapped.
    fn load_image(path: &Path, image: &[u8]) -> io::Result<HMODULE> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .share_mode(FILE_SHARE_READ)
            .open(path)?;
        file.write_all(image)?;
        file.flush()?;

        let handle = Self::load_path(path);
        drop(file);
        handle
    }

    /// Resolves a null-terminated export name to its address.
    ///
    /// # Safety
    ///
    /// The returned pointer must only be transmuted into the function pointer type matching the
    /// export's signature.
    unsafe fn resolve_func(&self, func_name: &'static [u8]) -> Result<*const libc::c_void> {
        GetProcAddress(self.handle, func_name.as_ptr())
            .map(|f| f as *const libc::c_void)
            .ok_or_else(|| {
                let name = &func_name[..func_name.len() - 1];
                Error::MissingSymbol(std::str::from_utf8(name).unwrap_or("<invalid>"))
            })
    }

    fn resolve_api(&self) -> Result<WintunApi> {
        unsafe {
            Ok(WintunApi {
                WintunCreateAdapter: mem::transmute(self.resolve_func(b"WintunCreateAdapter\0")?),
                WintunOpenAdapter: mem::transmute(self.resolve_func(b"WintunOpenAdapter\0")?),
                WintunCloseAdapter: mem::transmute(self.resolve_func(b"WintunCloseAdapter\0")?),
                WintunDeleteDriver: mem::transmute(self.resolve_func(b"WintunDeleteDriver\0")?),
                WintunGetAdapterLUID: mem::transmute(
                    self.resolve_func(b"WintunGetAdapterLUID\0")?,
                ),
                WintunGetRunningDriverVersion: mem::transmute(
                    self.resolve_func(b"WintunGetRunningDriverVersion\0")?,
                ),
                WintunSetLogger: mem::transmute(self.resolve_func(b"WintunSetLogger\0")?),
                WintunStartSession: mem::transmute(self.resolve_func(b"WintunStartSession\0")?),
                WintunEndSession: mem::transmute(self.resolve_func(b"WintunEndSession\0")?),
                WintunGetReadWaitEvent: mem::transmute(
                    self.resolve_func(b"WintunGetReadWaitEvent\0")?,
                ),
                WintunReceivePacket: mem::transmute(self.resolve_func(b"WintunReceivePacket\0")?),
                WintunReleaseReceivePacket: mem::transmute(
                    self.resolve_func(b"WintunReleaseReceivePacket\0")?,
                ),
                WintunAllocateSendPacket: mem::transmute(
                    self.resolve_func(b"WintunAllocateSendPacket\0")?,
                ),
                WintunSendPacket: mem::transmute(self.resolve_func(b"WintunSendPacket\0")?),
            })
        }
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        unsafe {
            FreeLibrary(self.handle);
        }

        if let Some(dir) = self.extracted.take() {
            // The image may still be mapped if another module loaded the same file.
            if let Err(e) = fs::remove_dir_all(&dir) {
                log::debug!("failed to remove {}: {}", dir.display(), e);
            }
        }
    }
}

impl NativeDriver {
    /// Loads Wintun from `source` and resolves every entry point.
    ///
    /// # Errors
    ///
    /// Fails with the OS error if the library could not be loaded, or with
    /// [`Error::MissingSymbol`] if a required function is missing from it. The module is
    /// unloaded again on failure.
    pub(crate) fn load(source: &DllSource) -> Result<Self> {
        let module = Module::open(source)?;
        let api = module.resolve_api()?;
        Ok(NativeDriver::new(api, Some(module)))
    }

    #[cfg(test)]
    fn extracted_dir(&self) -> Option<PathBuf> {
        self.module().and_then(|m| m.extracted.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_dirs_are_unique() {
        let a = Module::create_private_dir().unwrap();
        let b = Module::create_private_dir().unwrap();
        assert_ne!(a, b);

        fs::remove_dir(&a).unwrap();
        fs::remove_dir(&b).unwrap();
    }

    #[test]
    fn image_file_is_created_exclusively() {
        let dir = Module::create_private_dir().unwrap();
        let path = dir.join("wintun.dll");
        fs::write(&path, b"planted").unwrap();

        let err = Module::load_image(&path, b"MZ").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_exports() {
        let res = NativeDriver::load(&DllSource::from("kernel32.dll"));
        assert!(matches!(res, Err(Error::MissingSymbol("WintunCreateAdapter"))));
    }

    #[test]
    #[ignore = "requires wintun.dll next to the test executable"]
    fn load_from_memory() {
        let exe = env::current_exe().unwrap();
        let image = fs::read(exe.with_file_name("wintun.dll")).unwrap();

        let driver = NativeDriver::load(&DllSource::from(image)).unwrap();
        let dir = driver.extracted_dir().unwrap();
        assert!(dir.join("wintun.dll").exists());

        drop(driver);
        assert!(!dir.exists());
    }
}
