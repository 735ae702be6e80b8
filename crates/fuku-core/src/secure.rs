//! GPG-protected credential files
//!
//! Key material and database passwords live in the bucket as `<path>.gpg`.
//! A decrypted copy is cached under the rc directory, readable only by the
//! owner, and removed again when the owning selection is cleared.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{FukuError, Result};
use crate::object_store::ObjectStore;
use crate::runner::{Capture, CommandRunner, ShellCommand};

pub struct SecureFiles<'a> {
    rc_dir: PathBuf,
    objects: &'a dyn ObjectStore,
    runner: &'a dyn CommandRunner,
}

impl<'a> SecureFiles<'a> {
    pub fn new(
        rc_dir: impl Into<PathBuf>,
        objects: &'a dyn ObjectStore,
        runner: &'a dyn CommandRunner,
    ) -> Self {
        Self {
            rc_dir: rc_dir.into(),
            objects,
            runner,
        }
    }

    /// Local path of the decrypted copy of `path`
    pub fn local_path(&self, path: &str) -> PathBuf {
        self.rc_dir.join(path)
    }

    /// Return the decrypted copy of `path`, downloading and decrypting
    /// `<path>.gpg` first when it is not cached yet.
    pub async fn fetch(&self, path: &str) -> Result<PathBuf> {
        let full = self.local_path(path);
        if full.exists() {
            debug!(path = %full.display(), "secure file cached");
            return Ok(full);
        }

        let data = self
            .objects
            .get(&format!("{}.gpg", path))
            .await?
            .ok_or_else(|| FukuError::SecureFileMissing(path.to_string()))?;

        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let encrypted = encrypted_path(&full);
        fs::write(&encrypted, data)?;

        let decrypt = ShellCommand::new(format!(
            "gpg -o {} -d {}",
            full.display(),
            encrypted.display()
        ));
        if let Err(err) = self.runner.run(decrypt) {
            clear_local(&full);
            return Err(err);
        }
        make_private(&full)?;
        Ok(full)
    }

    /// Remove the decrypted copy of `path`; a missing file is not an error.
    pub fn clear(&self, path: &str) {
        clear_local(&self.local_path(path));
    }

    /// Write `contents` to the cache as an owner-only file.
    pub fn write_private(&self, path: &str, contents: &str) -> Result<PathBuf> {
        let full = self.local_path(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&full, contents)?;
        make_private(&full)?;
        Ok(full)
    }

    /// Encrypt a cached file with a passphrase, producing `<file>.gpg`.
    pub fn encrypt(&self, path: &str) -> Result<PathBuf> {
        let full = self.local_path(path);
        let encrypted = encrypted_path(&full);
        if encrypted.exists() {
            fs::remove_file(&encrypted)?;
        }
        self.runner
            .run(ShellCommand::new(format!("gpg -c {}", full.display())).capture(Capture::Stream))?;
        Ok(encrypted)
    }

    /// Upload the encrypted copy produced by [`SecureFiles::encrypt`].
    pub async fn upload(&self, path: &str) -> Result<()> {
        let body = fs::read(encrypted_path(&self.local_path(path)))?;
        self.objects.put(&format!("{}.gpg", path), body).await?;
        debug!(path, "uploaded secure file");
        Ok(())
    }

    /// Encrypt a cached file and upload it as `<path>.gpg`.
    pub async fn publish(&self, path: &str) -> Result<()> {
        self.encrypt(path)?;
        self.upload(path).await
    }
}

/// Remove the cached plaintext of `path` under `rc_dir`. Used by selection
/// hooks, which run offline.
pub fn remove_cached(rc_dir: &Path, path: &str) {
    clear_local(&rc_dir.join(path));
}

fn encrypted_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".gpg");
    PathBuf::from(name)
}

fn clear_local(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed secure file"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove secure file"),
    }
}

#[cfg(unix)]
fn make_private(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn make_private(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::MemoryObjectStore;
    use crate::runner::{CommandOutput, RecordingRunner};
    use tempfile::TempDir;

    /// Pretends to be gpg: "decrypts" by copying the input file.
    struct FakeGpg;

    impl CommandRunner for FakeGpg {
        fn run(&self, command: ShellCommand) -> Result<CommandOutput> {
            let parts: Vec<&str> = command.line.split_whitespace().collect();
            if let ["gpg", "-o", output, "-d", input] = parts.as_slice() {
                fs::copy(input, output)?;
            }
            Ok(CommandOutput::success())
        }
    }

    #[tokio::test]
    async fn test_fetch_downloads_and_decrypts() {
        let dir = TempDir::new().unwrap();
        let objects = MemoryObjectStore::new();
        objects
            .put("prod/key.pem.gpg", b"PRIVATE KEY".to_vec())
            .await
            .unwrap();

        let secure = SecureFiles::new(dir.path(), &objects, &FakeGpg);
        let path = secure.fetch("prod/key.pem").await.unwrap();

        assert_eq!(path, dir.path().join("prod/key.pem"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "PRIVATE KEY");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_fetch_uses_cache() {
        let dir = TempDir::new().unwrap();
        let objects = MemoryObjectStore::new();
        let runner = RecordingRunner::new();
        let secure = SecureFiles::new(dir.path(), &objects, &runner);
        secure.write_private("prod/key.pem", "cached").unwrap();

        let path = secure.fetch("prod/key.pem").await.unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "cached");
        assert!(runner.lines().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_missing_object() {
        let dir = TempDir::new().unwrap();
        let objects = MemoryObjectStore::new();
        let runner = RecordingRunner::new();
        let secure = SecureFiles::new(dir.path(), &objects, &runner);

        let err = secure.fetch("prod/key.pem").await.unwrap_err();
        assert_eq!(err.to_string(), "no secure key file found: prod/key.pem");
    }

    #[tokio::test]
    async fn test_failed_decrypt_leaves_no_plaintext() {
        let dir = TempDir::new().unwrap();
        let objects = MemoryObjectStore::new();
        objects.put("prod/key.pem.gpg", b"x".to_vec()).await.unwrap();
        let runner = RecordingRunner::new();
        runner.fail("bad passphrase");

        let secure = SecureFiles::new(dir.path(), &objects, &runner);
        assert!(secure.fetch("prod/key.pem").await.is_err());
        assert!(!dir.path().join("prod/key.pem").exists());
    }

    #[tokio::test]
    async fn test_access_denied_propagates() {
        let dir = TempDir::new().unwrap();
        let objects = MemoryObjectStore::new();
        objects.deny("prod/key.pem.gpg");
        let runner = RecordingRunner::new();

        let secure = SecureFiles::new(dir.path(), &objects, &runner);
        let err = secure.fetch("prod/key.pem").await.unwrap_err();
        assert!(matches!(err, FukuError::ObjectStore(_)));
    }

    #[test]
    fn test_clear_missing_file() {
        let dir = TempDir::new().unwrap();
        let objects = MemoryObjectStore::new();
        let runner = RecordingRunner::new();
        let secure = SecureFiles::new(dir.path(), &objects, &runner);
        secure.clear("prod/key.pem");

        secure.write_private("prod/key.pem", "secret").unwrap();
        secure.clear("prod/key.pem");
        assert!(!dir.path().join("prod/key.pem").exists());
    }

    #[test]
    fn test_encrypt_runs_gpg() {
        let dir = TempDir::new().unwrap();
        let objects = MemoryObjectStore::new();
        let runner = RecordingRunner::new();
        let secure = SecureFiles::new(dir.path(), &objects, &runner);
        secure.write_private("prod/api/main.pgpass", "h:5432:main:main:pw").unwrap();

        let encrypted = secure.encrypt("prod/api/main.pgpass").unwrap();
        assert_eq!(encrypted, dir.path().join("prod/api/main.pgpass.gpg"));
        assert_eq!(
            runner.lines(),
            vec![format!(
                "gpg -c {}",
                dir.path().join("prod/api/main.pgpass").display()
            )]
        );
    }

    #[tokio::test]
    async fn test_upload_encrypted_copy() {
        let dir = TempDir::new().unwrap();
        let objects = MemoryObjectStore::new();
        let runner = RecordingRunner::new();
        let secure = SecureFiles::new(dir.path(), &objects, &runner);
        secure.write_private("prod/key.pem", "plain").unwrap();
        fs::write(dir.path().join("prod/key.pem.gpg"), "cipher").unwrap();

        secure.upload("prod/key.pem").await.unwrap();
        assert_eq!(
            objects.get("prod/key.pem.gpg").await.unwrap(),
            Some(b"cipher".to_vec())
        );
    }

    #[test]
    fn test_remove_cached() {
        let dir = TempDir::new().unwrap();
        let objects = MemoryObjectStore::new();
        let runner = RecordingRunner::new();
        SecureFiles::new(dir.path(), &objects, &runner)
            .write_private("prod/key.pem", "secret")
            .unwrap();

        remove_cached(dir.path(), "prod/key.pem");
        assert!(!dir.path().join("prod/key.pem").exists());
        remove_cached(dir.path(), "prod/key.pem");
    }
}
