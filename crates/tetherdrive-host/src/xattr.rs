//! Extended attributes handler.
//!
//! Persists placeholder state in the `user.tetherdrive.*` namespace.
//!
//! ## Supported Extended Attributes
//!
//! - `user.tetherdrive.state` - [`PlaceholderState`] name (`placeholder`, `in_sync`, ...)
//! - `user.tetherdrive.pin` - [`PinState`] name (`inherit`, `pinned`, `unpinned`)
//! - `user.tetherdrive.offline` - `1` while content or children are not on disk
//! - `user.tetherdrive.identity` - `<length>:<mtime millis>` of the remote entry
//!
//! An entry without a state attribute is not managed by the host.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::str::FromStr;

use tetherdrive_core::domain::{IdentityHash, PinState, PlaceholderState};

use crate::error::HostError;

// ============================================================================
// Constants for xattr namespace
// ============================================================================

pub const XATTR_STATE: &str = "user.tetherdrive.state";

pub const XATTR_PIN: &str = "user.tetherdrive.pin";

pub const XATTR_OFFLINE: &str = "user.tetherdrive.offline";

pub const XATTR_IDENTITY: &str = "user.tetherdrive.identity";

/// Written and removed again by [`is_supported`]
const XATTR_SUPPORT_CHECK: &str = "user.tetherdrive.support-check";

/// Returns a list of all attribute names managed by the host.
#[must_use]
pub fn list_xattrs() -> Vec<&'static str> {
    vec![XATTR_STATE, XATTR_PIN, XATTR_OFFLINE, XATTR_IDENTITY]
}

// ============================================================================
// Raw access
// ============================================================================

fn c_string(path: &Path, value: &[u8]) -> Result<CString, HostError> {
    CString::new(value).map_err(|_| {
        HostError::InvalidArgument(format!("interior NUL byte in {}", path.display()))
    })
}

/// Reads attribute `name` of `path`, `Ok(None)` if it is not set
pub fn get(path: &Path, name: &str) -> Result<Option<Vec<u8>>, HostError> {
    let c_path = c_string(path, path.as_os_str().as_bytes())?;
    let c_name = c_string(path, name.as_bytes())?;
    let mut buf = vec![0u8; 64];

    loop {
        // SAFETY: both strings are NUL-terminated and outlive the call; the
        // buffer pointer and length describe writable memory we own.
        let n = unsafe {
            libc::getxattr(
                c_path.as_ptr(),
                c_name.as_ptr(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        };
        if n >= 0 {
            buf.truncate(n as usize);
            return Ok(Some(buf));
        }

        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ENODATA) => return Ok(None),
            Some(libc::ERANGE) => {
                // SAFETY: a null buffer of size 0 only queries the value size.
                let size = unsafe {
                    libc::getxattr(c_path.as_ptr(), c_name.as_ptr(), std::ptr::null_mut(), 0)
                };
                if size < 0 {
                    return Err(HostError::from_io(path, std::io::Error::last_os_error()));
                }
                buf.resize(size as usize + 1, 0);
            }
            _ => return Err(HostError::from_io(path, err)),
        }
    }
}

/// Sets attribute `name` of `path` to `value`
pub fn set(path: &Path, name: &str, value: &[u8]) -> Result<(), HostError> {
    let c_path = c_string(path, path.as_os_str().as_bytes())?;
    let c_name = c_string(path, name.as_bytes())?;

    // SAFETY: both strings are NUL-terminated; value pointer and length come
    // from a live slice.
    let rc = unsafe {
        libc::setxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            0,
        )
    };
    if rc != 0 {
        return Err(HostError::from_io(path, std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Removes attribute `name` of `path`; an unset attribute is not an error
pub fn remove(path: &Path, name: &str) -> Result<(), HostError> {
    let c_path = c_string(path, path.as_os_str().as_bytes())?;
    let c_name = c_string(path, name.as_bytes())?;

    // SAFETY: both strings are NUL-terminated and outlive the call.
    let rc = unsafe { libc::removexattr(c_path.as_ptr(), c_name.as_ptr()) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENODATA) {
            return Err(HostError::from_io(path, err));
        }
    }
    Ok(())
}

/// Whether the filesystem holding `dir` accepts user extended attributes
pub fn is_supported(dir: &Path) -> bool {
    if set(dir, XATTR_SUPPORT_CHECK, b"1").is_err() {
        return false;
    }
    remove(dir, XATTR_SUPPORT_CHECK).is_ok()
}

// ============================================================================
// StoredAttrs
// ============================================================================

/// Decoded `user.tetherdrive.*` attributes of one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredAttrs {
    pub state: PlaceholderState,
    pub pin: PinState,
    pub offline: bool,
    pub identity: Option<IdentityHash>,
}

impl StoredAttrs {
    /// Attributes of a freshly created placeholder
    pub fn placeholder(offline: bool, identity: Option<IdentityHash>) -> Self {
        Self {
            state: PlaceholderState::Placeholder,
            pin: PinState::Inherit,
            offline,
            identity,
        }
    }

    /// Reads the attributes of `path`, `Ok(None)` for an unmanaged entry
    pub fn read(path: &Path) -> Result<Option<Self>, HostError> {
        let Some(state) = get(path, XATTR_STATE)? else {
            return Ok(None);
        };
        let state = parse::<PlaceholderState>(XATTR_STATE, &state)?;
        let pin = match get(path, XATTR_PIN)? {
            Some(raw) => parse::<PinState>(XATTR_PIN, &raw)?,
            None => PinState::Inherit,
        };
        let offline = get(path, XATTR_OFFLINE)?.is_some_and(|raw| raw == b"1");
        let identity = get(path, XATTR_IDENTITY)?
            .map(|raw| parse::<IdentityHash>(XATTR_IDENTITY, &raw))
            .transpose()?;

        Ok(Some(Self {
            state,
            pin,
            offline,
            identity,
        }))
    }

    /// Writes every attribute to `path`
    pub fn write(&self, path: &Path) -> Result<(), HostError> {
        set(path, XATTR_STATE, self.state.as_str().as_bytes())?;
        set(path, XATTR_PIN, self.pin.as_str().as_bytes())?;
        set(path, XATTR_OFFLINE, if self.offline { b"1" } else { b"0" })?;
        match self.identity {
            Some(identity) => set(path, XATTR_IDENTITY, identity.to_string().as_bytes()),
            None => remove(path, XATTR_IDENTITY),
        }
    }
}

fn parse<T: FromStr>(name: &str, raw: &[u8]) -> Result<T, HostError> {
    let value = String::from_utf8_lossy(raw);
    value.parse::<T>().map_err(|_| HostError::InvalidAttribute {
        name: name.to_string(),
        value: value.into_owned(),
    })
}
