//! Write access to protected system files.
//!
//! On Windows the file's DACL is replaced with "Everyone: read,
//! Administrators: full control". If that is denied, ownership is first taken
//! for the Administrators group with `SeTakeOwnershipPrivilege` and the DACL
//! is set again. Every SID, ACL and token handle is released by a guard no
//! matter which step fails.

use std::path::Path;

#[cfg(target_os = "windows")]
use crate::resolver::to_wide;
#[cfg(target_os = "windows")]
use windows::core::{w, PCWSTR, PWSTR};
#[cfg(target_os = "windows")]
use windows::Win32::Foundation::{
    CloseHandle, GetLastError, LocalFree, ERROR_ACCESS_DENIED, ERROR_NOT_ALL_ASSIGNED,
    ERROR_SUCCESS, GENERIC_ALL, GENERIC_READ, HANDLE, HLOCAL, LUID,
};
#[cfg(target_os = "windows")]
use windows::Win32::Security::Authorization::{
    SetEntriesInAclW, SetNamedSecurityInfoW, EXPLICIT_ACCESS_W, NO_MULTIPLE_TRUSTEE,
    SET_ACCESS, SE_FILE_OBJECT, TRUSTEE_IS_GROUP, TRUSTEE_IS_SID, TRUSTEE_IS_WELL_KNOWN_GROUP,
    TRUSTEE_TYPE, TRUSTEE_W,
};
#[cfg(target_os = "windows")]
use windows::Win32::Security::{
    AdjustTokenPrivileges, AllocateAndInitializeSid, FreeSid, LookupPrivilegeValueW, ACL,
    DACL_SECURITY_INFORMATION, LUID_AND_ATTRIBUTES, NO_INHERITANCE, OWNER_SECURITY_INFORMATION,
    PSID, SE_PRIVILEGE_ENABLED, SID_IDENTIFIER_AUTHORITY, TOKEN_ADJUST_PRIVILEGES,
    TOKEN_PRIVILEGES, TOKEN_PRIVILEGES_ATTRIBUTES,
};
#[cfg(target_os = "windows")]
use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

/// Grants the right to replace a file.
pub trait WriteAccess {
    /// Make `path` writable (and renamable) by this process.
    ///
    /// Idempotent; returns `false` if access could not be obtained.
    fn ensure_writable(&self, path: &Path) -> bool;
}

/// Uses the operating system's ownership and ACL machinery.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemAccess;

impl WriteAccess for SystemAccess {
    fn ensure_writable(&self, path: &Path) -> bool {
        ensure_writable(path)
    }
}

/// Clear the read-only bit if set.
#[cfg(not(target_os = "windows"))]
pub fn ensure_writable(path: &Path) -> bool {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("can't stat {}: {}", path.display(), e);
            return false;
        }
    };

    let mut permissions = metadata.permissions();
    if !permissions.readonly() {
        return true;
    }

    #[allow(clippy::permissions_set_readonly_false)]
    permissions.set_readonly(false);
    match std::fs::set_permissions(path, permissions) {
        Ok(()) => true,
        Err(e) => {
            tracing::error!("can't make {} writable: {}", path.display(), e);
            false
        }
    }
}

#[cfg(target_os = "windows")]
const SECURITY_WORLD_SID_AUTHORITY: SID_IDENTIFIER_AUTHORITY = SID_IDENTIFIER_AUTHORITY {
    Value: [0, 0, 0, 0, 0, 1],
};
#[cfg(target_os = "windows")]
const SECURITY_NT_AUTHORITY: SID_IDENTIFIER_AUTHORITY = SID_IDENTIFIER_AUTHORITY {
    Value: [0, 0, 0, 0, 0, 5],
};
#[cfg(target_os = "windows")]
const SECURITY_WORLD_RID: u32 = 0;
#[cfg(target_os = "windows")]
const SECURITY_BUILTIN_DOMAIN_RID: u32 = 0x20;
#[cfg(target_os = "windows")]
const DOMAIN_ALIAS_RID_ADMINS: u32 = 0x220;

/// SID from `AllocateAndInitializeSid`, freed on drop.
#[cfg(target_os = "windows")]
struct OwnedSid(PSID);

#[cfg(target_os = "windows")]
impl OwnedSid {
    fn allocate(authority: &SID_IDENTIFIER_AUTHORITY, rids: &[u32]) -> windows::core::Result<Self> {
        let mut sub = [0u32; 8];
        sub[..rids.len()].copy_from_slice(rids);
        let mut sid = PSID::default();
        unsafe {
            AllocateAndInitializeSid(
                authority,
                rids.len() as u8,
                sub[0],
                sub[1],
                sub[2],
                sub[3],
                sub[4],
                sub[5],
                sub[6],
                sub[7],
                &mut sid,
            )?;
        }
        Ok(Self(sid))
    }
}

#[cfg(target_os = "windows")]
impl Drop for OwnedSid {
    fn drop(&mut self) {
        if !self.0 .0.is_null() {
            let _ = unsafe { FreeSid(self.0) };
        }
    }
}

/// ACL from `SetEntriesInAclW`, freed with `LocalFree` on drop.
#[cfg(target_os = "windows")]
struct OwnedAcl(*mut ACL);

#[cfg(target_os = "windows")]
impl Drop for OwnedAcl {
    fn drop(&mut self) {
        if !self.0.is_null() {
            let _ = unsafe { LocalFree(Some(HLOCAL(self.0 as *mut _))) };
        }
    }
}

/// Process token handle, closed on drop.
#[cfg(target_os = "windows")]
struct OwnedToken(HANDLE);

#[cfg(target_os = "windows")]
impl Drop for OwnedToken {
    fn drop(&mut self) {
        let _ = unsafe { CloseHandle(self.0) };
    }
}

#[cfg(target_os = "windows")]
fn explicit_access(permissions: u32, trustee_type: TRUSTEE_TYPE, sid: &OwnedSid) -> EXPLICIT_ACCESS_W {
    EXPLICIT_ACCESS_W {
        grfAccessPermissions: permissions,
        grfAccessMode: SET_ACCESS,
        grfInheritance: NO_INHERITANCE,
        Trustee: TRUSTEE_W {
            pMultipleTrustee: std::ptr::null_mut(),
            MultipleTrusteeOperation: NO_MULTIPLE_TRUSTEE,
            TrusteeForm: TRUSTEE_IS_SID,
            TrusteeType: trustee_type,
            ptstrName: PWSTR(sid.0 .0 as *mut u16),
        },
    }
}

#[cfg(target_os = "windows")]
fn set_privilege(token: &OwnedToken, name: PCWSTR, enable: bool) -> bool {
    let mut luid = LUID::default();
    if let Err(e) = unsafe { LookupPrivilegeValueW(PCWSTR::null(), name, &mut luid) } {
        tracing::error!("LookupPrivilegeValue error: {}", e);
        return false;
    }

    let privileges = TOKEN_PRIVILEGES {
        PrivilegeCount: 1,
        Privileges: [LUID_AND_ATTRIBUTES {
            Luid: luid,
            Attributes: if enable {
                SE_PRIVILEGE_ENABLED
            } else {
                TOKEN_PRIVILEGES_ATTRIBUTES(0)
            },
        }],
    };

    if let Err(e) = unsafe {
        AdjustTokenPrivileges(
            token.0,
            false,
            Some(&privileges as *const _),
            std::mem::size_of::<TOKEN_PRIVILEGES>() as u32,
            None,
            None,
        )
    } {
        tracing::error!("AdjustTokenPrivileges error: {}", e);
        return false;
    }

    // AdjustTokenPrivileges succeeds even when nothing was assigned.
    if unsafe { GetLastError() } == ERROR_NOT_ALL_ASSIGNED {
        tracing::error!("the token does not have the specified privilege");
        return false;
    }

    true
}

/// Take ownership of `path` for Administrators and grant them full control.
#[cfg(target_os = "windows")]
pub fn ensure_writable(path: &Path) -> bool {
    let everyone = match OwnedSid::allocate(&SECURITY_WORLD_SID_AUTHORITY, &[SECURITY_WORLD_RID]) {
        Ok(sid) => sid,
        Err(e) => {
            tracing::error!("AllocateAndInitializeSid (Everyone) error: {}", e);
            return false;
        }
    };
    let admins = match OwnedSid::allocate(
        &SECURITY_NT_AUTHORITY,
        &[SECURITY_BUILTIN_DOMAIN_RID, DOMAIN_ALIAS_RID_ADMINS],
    ) {
        Ok(sid) => sid,
        Err(e) => {
            tracing::error!("AllocateAndInitializeSid (Admin) error: {}", e);
            return false;
        }
    };

    let entries = [
        explicit_access(GENERIC_READ.0, TRUSTEE_IS_WELL_KNOWN_GROUP, &everyone),
        explicit_access(GENERIC_ALL.0, TRUSTEE_IS_GROUP, &admins),
    ];

    let mut acl = OwnedAcl(std::ptr::null_mut());
    let status = unsafe { SetEntriesInAclW(Some(&entries[..]), None, &mut acl.0) };
    if status != ERROR_SUCCESS {
        tracing::error!("SetEntriesInAcl failed: {}", status.0);
        return false;
    }

    let name = to_wide(path.as_os_str());
    let set_dacl = || unsafe {
        SetNamedSecurityInfoW(
            PCWSTR(name.as_ptr()),
            SE_FILE_OBJECT,
            DACL_SECURITY_INFORMATION,
            None,
            None,
            Some(acl.0 as *const ACL),
            None,
        )
    };

    let status = set_dacl();
    if status == ERROR_SUCCESS {
        tracing::info!("changed DACL of {}", path.display());
        return true;
    }
    if status != ERROR_ACCESS_DENIED {
        tracing::error!("first SetNamedSecurityInfo call failed: {}", status.0);
        return false;
    }

    let mut token = OwnedToken(HANDLE::default());
    if let Err(e) =
        unsafe { OpenProcessToken(GetCurrentProcess(), TOKEN_ADJUST_PRIVILEGES, &mut token.0) }
    {
        tracing::error!("OpenProcessToken failed: {}", e);
        return false;
    }

    let take_ownership = w!("SeTakeOwnershipPrivilege");
    if !set_privilege(&token, take_ownership, true) {
        tracing::error!("you must be logged on as Administrator");
        return false;
    }

    let status = unsafe {
        SetNamedSecurityInfoW(
            PCWSTR(name.as_ptr()),
            SE_FILE_OBJECT,
            OWNER_SECURITY_INFORMATION,
            Some(admins.0),
            None,
            None,
            None,
        )
    };
    if status != ERROR_SUCCESS {
        tracing::error!("could not set owner: {}", status.0);
        return false;
    }

    if !set_privilege(&token, take_ownership, false) {
        tracing::error!("failed to drop SeTakeOwnershipPrivilege");
        return false;
    }

    let status = set_dacl();
    if status != ERROR_SUCCESS {
        tracing::error!("second SetNamedSecurityInfo call failed: {}", status.0);
        return false;
    }

    tracing::info!("took ownership and changed DACL of {}", path.display());
    true
}
