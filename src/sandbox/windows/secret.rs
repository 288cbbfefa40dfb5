//! Registry-backed secret store and machine-scope DPAPI.

use windows::Win32::Foundation::{ERROR_FILE_NOT_FOUND, HLOCAL, LocalFree, WIN32_ERROR};
use windows::Win32::Security::Authorization::SE_REGISTRY_KEY;
use windows::Win32::Security::Cryptography::{
    CRYPT_INTEGER_BLOB, CRYPTPROTECT_LOCAL_MACHINE, CRYPTPROTECT_UI_FORBIDDEN, CryptProtectData,
    CryptUnprotectData,
};
use windows::Win32::System::Registry::{
    HKEY, HKEY_LOCAL_MACHINE, KEY_READ, KEY_WRITE, REG_BINARY, REG_OPTION_NON_VOLATILE, REG_SZ,
    REG_VALUE_TYPE, RegCloseKey, RegCreateKeyExW, RegDeleteValueW, RegQueryValueExW,
    RegSetValueExW,
};
use windows::core::PCWSTR;

use super::acl::apply_sddl_dacl;
use super::sid::{setup_err, wide};
use crate::sandbox::acl::secret_key_acl;
use crate::sandbox::credential::{SecretProtector, SecretStore, StoredSecret};
use crate::sandbox::error::Result;

const KEY_PATH: &str = r"SOFTWARE\AgentSandbox";
/// Same key in the object namespace used by `SetNamedSecurityInfoW`.
const KEY_OBJECT_NAME: &str = r"MACHINE\SOFTWARE\AgentSandbox";
const ENCRYPTED_VALUE: &str = "Credential";
/// Written by older releases.
const LEGACY_PLAINTEXT_VALUE: &str = "Password";

struct Key(HKEY);

impl Key {
    fn open() -> Result<Self> {
        let path = wide(KEY_PATH);
        let mut hkey = HKEY::default();
        unsafe {
            RegCreateKeyExW(
                HKEY_LOCAL_MACHINE,
                PCWSTR(path.as_ptr()),
                None,
                PCWSTR::null(),
                REG_OPTION_NON_VOLATILE,
                KEY_READ | KEY_WRITE,
                None,
                &mut hkey,
                None,
            )
        }
        .ok()
        .map_err(|e| setup_err("open credential key", e))?;
        Ok(Self(hkey))
    }

    fn query(&self, name: &str) -> Result<Option<(REG_VALUE_TYPE, Vec<u8>)>> {
        let wide_name = wide(name);
        let mut kind = REG_VALUE_TYPE::default();
        let mut len = 0u32;
        let status = unsafe {
            RegQueryValueExW(
                self.0,
                PCWSTR(wide_name.as_ptr()),
                None,
                Some(&mut kind),
                None,
                Some(&mut len),
            )
        };
        if status == ERROR_FILE_NOT_FOUND {
            return Ok(None);
        }
        status.ok().map_err(|e| setup_err("size credential value", e))?;

        let mut data = vec![0u8; len as usize];
        unsafe {
            RegQueryValueExW(
                self.0,
                PCWSTR(wide_name.as_ptr()),
                None,
                Some(&mut kind),
                Some(data.as_mut_ptr()),
                Some(&mut len),
            )
        }
        .ok()
        .map_err(|e| setup_err("read credential value", e))?;
        data.truncate(len as usize);
        Ok(Some((kind, data)))
    }
}

impl Drop for Key {
    fn drop(&mut self) {
        unsafe {
            let _ = RegCloseKey(self.0);
        }
    }
}

fn utf16_value(data: &[u8]) -> String {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// `HKLM\SOFTWARE\AgentSandbox`.
pub struct RegistrySecretStore;

impl SecretStore for RegistrySecretStore {
    fn load(&self) -> Result<Option<StoredSecret>> {
        let key = Key::open()?;
        if let Some((_, blob)) = key.query(ENCRYPTED_VALUE)? {
            return Ok(Some(StoredSecret::Encrypted(blob)));
        }
        match key.query(LEGACY_PLAINTEXT_VALUE)? {
            Some((kind, data)) if kind == REG_SZ => {
                Ok(Some(StoredSecret::Plaintext(utf16_value(&data))))
            }
            _ => Ok(None),
        }
    }

    fn save_encrypted(&self, blob: &[u8]) -> Result<()> {
        let key = Key::open()?;
        let name = wide(ENCRYPTED_VALUE);
        unsafe { RegSetValueExW(key.0, PCWSTR(name.as_ptr()), None, REG_BINARY, Some(blob)) }
            .ok()
            .map_err(|e| setup_err("write credential value", e))?;

        let legacy = wide(LEGACY_PLAINTEXT_VALUE);
        let status: WIN32_ERROR = unsafe { RegDeleteValueW(key.0, PCWSTR(legacy.as_ptr())) };
        if status != ERROR_FILE_NOT_FOUND {
            status
                .ok()
                .map_err(|e| setup_err("remove plaintext credential", e))?;
        }
        Ok(())
    }

    fn restrict_access(&self, allowed_sids: &[String]) -> Result<()> {
        let sddl = secret_key_acl(allowed_sids).to_sddl();
        apply_sddl_dacl(KEY_OBJECT_NAME, SE_REGISTRY_KEY, &sddl)
    }
}

/// `CryptProtectData` with `CRYPTPROTECT_LOCAL_MACHINE`.
pub struct DpapiProtector;

impl DpapiProtector {
    fn transform(&self, input: &[u8], entropy: &[u8], protect: bool) -> Result<Vec<u8>> {
        let data_in = CRYPT_INTEGER_BLOB {
            cbData: input.len() as u32,
            pbData: input.as_ptr() as *mut u8,
        };
        let entropy_blob = CRYPT_INTEGER_BLOB {
            cbData: entropy.len() as u32,
            pbData: entropy.as_ptr() as *mut u8,
        };
        let mut data_out = CRYPT_INTEGER_BLOB::default();
        let flags = CRYPTPROTECT_LOCAL_MACHINE | CRYPTPROTECT_UI_FORBIDDEN;

        let result = unsafe {
            if protect {
                CryptProtectData(
                    &data_in,
                    PCWSTR::null(),
                    Some(&entropy_blob),
                    None,
                    None,
                    flags,
                    &mut data_out,
                )
            } else {
                CryptUnprotectData(
                    &data_in,
                    None,
                    Some(&entropy_blob),
                    None,
                    None,
                    flags,
                    &mut data_out,
                )
            }
        };
        result.map_err(|e| {
            setup_err(if protect { "encrypt secret" } else { "decrypt secret" }, e)
        })?;

        let out = unsafe {
            std::slice::from_raw_parts(data_out.pbData, data_out.cbData as usize).to_vec()
        };
        unsafe {
            let _ = LocalFree(Some(HLOCAL(data_out.pbData.cast())));
        }
        Ok(out)
    }
}

impl SecretProtector for DpapiProtector {
    fn protect(&self, plaintext: &[u8], entropy: &[u8]) -> Result<Vec<u8>> {
        self.transform(plaintext, entropy, true)
    }

    fn unprotect(&self, blob: &[u8], entropy: &[u8]) -> Result<Vec<u8>> {
        self.transform(blob, entropy, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::credential::SECRET_ENTROPY;

    #[test]
    fn test_utf16_value_stops_at_nul() {
        let data: Vec<u8> = "pw\0junk"
            .encode_utf16()
            .flat_map(|u| u.to_le_bytes())
            .collect();
        assert_eq!(utf16_value(&data), "pw");
    }

    #[test]
    fn test_dpapi_requires_matching_entropy() {
        let blob = DpapiProtector.protect(b"secret", SECRET_ENTROPY).unwrap();
        assert_ne!(blob, b"secret");
        assert_eq!(
            DpapiProtector.unprotect(&blob, SECRET_ENTROPY).unwrap(),
            b"secret"
        );
        assert!(DpapiProtector.unprotect(&blob, b"other").is_err());
    }
}
