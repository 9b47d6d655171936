use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use lru::LruCache;
use openssl::pkey::{PKey, Private};
use openssl::rand::rand_bytes;
use openssl::x509::{X509Crl, X509Req, X509};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::encryption::{
    decode_single_block, decrypt_private_key_pem, encrypt_private_key_pem, CERTIFICATE_REQUEST_TAG,
    CERTIFICATE_TAG, REVOCATION_LIST_TAG,
};
use crate::error::{Error, Result};
use crate::providers::{CertificateFactory, CertificateRequestFactory};
use crate::secret::SecretWrapper;

pub const KEY_EXTENSION: &str = ".key";
pub const CRT_EXTENSION: &str = ".crt";
pub const CSR_EXTENSION: &str = ".csr";
pub const CRL_EXTENSION: &str = ".crl";
pub const ATTRIBUTES_EXTENSION: &str = ".json";

/// Every suffix the store scanner recognizes.
pub const STORE_EXTENSIONS: [&str; 5] = [
    KEY_EXTENSION,
    CRT_EXTENSION,
    CSR_EXTENSION,
    CRL_EXTENSION,
    ATTRIBUTES_EXTENSION,
];

const STORE_SETTINGS_FILE: &str = ".store";
const STORE_SECRET_SIZE: usize = 32;
const STORE_DIR_MODE: u32 = 0o700;
const STORE_FILE_MODE: u32 = 0o600;
const ARTIFACT_CACHE_CAPACITY: usize = 100;

#[derive(Serialize, Deserialize)]
struct StoreSettings {
    secret: String,
}

/// The JSON attributes every entry carries. Unknown keys are reserved and
/// ignored on read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreEntryAttributes {
    pub provider: String,
}

/// File-backed certificate store. One flat directory holds up to five
/// artifacts per entry name plus the `.store` settings file carrying the
/// key-encryption secret.
pub struct FsStore {
    name: String,
    path: PathBuf,
    secret: SecretWrapper,
    index: RwLock<Vec<String>>,
    certificate_cache: Mutex<LruCache<String, Arc<X509>>>,
    certificate_request_cache: Mutex<LruCache<String, Arc<X509Req>>>,
    revocation_list_cache: Mutex<LruCache<String, Arc<X509Crl>>>,
    attributes_cache: Mutex<LruCache<String, Arc<StoreEntryAttributes>>>,
}

impl FsStore {
    /// Create a new store at `path` and open it. The directory must not
    /// exist yet; a fresh secret is generated and persisted.
    pub fn init<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Creating FS certificate store");
        let mut builder = DirBuilder::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(STORE_DIR_MODE);
        }
        builder.create(path).map_err(|err| {
            if err.kind() == ErrorKind::AlreadyExists {
                Error::AlreadyExists(path.display().to_string())
            } else {
                err.into()
            }
        })?;
        let mut secret_bytes = [0u8; STORE_SECRET_SIZE];
        rand_bytes(&mut secret_bytes)?;
        let settings = StoreSettings {
            secret: BASE64.encode(secret_bytes),
        };
        let settings_bytes = serde_json::to_vec_pretty(&settings)?;
        let mut settings_file = store_file_options().open(path.join(STORE_SETTINGS_FILE))?;
        settings_file.write_all(&settings_bytes)?;
        drop(settings_file);
        Self::open_path(path)
    }

    /// Open an existing store. The `.store` settings file must be present.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_path(path.as_ref())
    }

    fn open_path(path: &Path) -> Result<Self> {
        let path = fs::canonicalize(path)
            .map_err(|err| Error::StoreCorrupt(format!("store path unusable: {}", err)))?;
        let name = format!("fs:{}", path.display());
        info!(store = %name, "Opening FS certificate store");
        let settings = Self::load_settings(&path)?;
        // The base64 text itself is the key-encryption password.
        let secret = SecretWrapper::wrap(settings.secret.as_bytes())?;
        let cache_capacity =
            NonZeroUsize::new(ARTIFACT_CACHE_CAPACITY).expect("cache capacity is non-zero");
        let store = Self {
            name,
            path,
            secret,
            index: RwLock::new(Vec::new()),
            certificate_cache: Mutex::new(LruCache::new(cache_capacity)),
            certificate_request_cache: Mutex::new(LruCache::new(cache_capacity)),
            revocation_list_cache: Mutex::new(LruCache::new(cache_capacity)),
            attributes_cache: Mutex::new(LruCache::new(cache_capacity)),
        };
        store.scan()?;
        Ok(store)
    }

    fn load_settings(path: &Path) -> Result<StoreSettings> {
        let settings_file = path.join(STORE_SETTINGS_FILE);
        let settings_bytes = fs::read(&settings_file).map_err(|err| {
            Error::StoreCorrupt(format!(
                "failed to read store settings file '{}': {}",
                settings_file.display(),
                err
            ))
        })?;
        serde_json::from_slice(&settings_bytes).map_err(|err| {
            Error::StoreCorrupt(format!(
                "failed to parse store settings file '{}': {}",
                settings_file.display(),
                err
            ))
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scan the store directory one level deep and build the entry index.
    fn scan(&self) -> Result<()> {
        info!(store = %self.name, "Scanning...");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&self.path)?.permissions().mode() & 0o777;
            if (mode | STORE_DIR_MODE) != STORE_DIR_MODE {
                warn!(store = %self.name, mode = %format!("{:o}", mode), "Insecure store path permissions");
            }
        }
        let mut file_names = Vec::new();
        for dir_entry in fs::read_dir(&self.path)? {
            let dir_entry = dir_entry?;
            let file_name = match dir_entry.file_name().into_string() {
                Ok(file_name) => file_name,
                Err(file_name) => {
                    info!(file = ?file_name, "Ignoring unrecognized file");
                    continue;
                }
            };
            if dir_entry.file_type()?.is_dir() {
                info!(dir = %file_name, "Ignoring unrecognized directory");
                continue;
            }
            file_names.push(file_name);
        }
        // Entries share a stem across suffixes, so after sorting a single
        // compare against the last admitted name deduplicates the candidates.
        file_names.sort();
        let mut entries = self.index.write().expect("store index lock poisoned");
        for file_name in file_names {
            if file_name == STORE_SETTINGS_FILE {
                continue;
            }
            let entry_name = match strip_store_extension(&file_name) {
                Some(entry_name) => entry_name,
                None => {
                    info!(file = %file_name, "Ignoring unrecognized file");
                    continue;
                }
            };
            debug!(file = %file_name, "Found store file");
            if entries.last().map(String::as_str) == Some(entry_name) {
                continue;
            }
            if self.validate_entry(entry_name) {
                debug!(entry = %entry_name, "Adding store entry");
                entries.push(entry_name.to_string());
            } else {
                warn!(file = %file_name, "Ignoring unrelated file");
            }
        }
        Ok(())
    }

    fn validate_entry(&self, name: &str) -> bool {
        let has_attributes = self.has_artifact(name, ATTRIBUTES_EXTENSION);
        let has_certificate = self.has_artifact(name, CRT_EXTENSION);
        let has_key = self.has_artifact(name, KEY_EXTENSION);
        let has_certificate_request = self.has_artifact(name, CSR_EXTENSION);
        has_attributes && (has_certificate || (has_key && has_certificate_request))
    }

    /// A snapshot cursor over the current entry index, in ascending name
    /// order. Entries created later are not observed.
    pub fn entries(&self) -> StoreEntries<'_> {
        let entries = self.index.read().expect("store index lock poisoned").clone();
        StoreEntries {
            store: self,
            entries,
            next: 0,
        }
    }

    /// Look up a single entry. An entry exists iff its attributes artifact
    /// exists; the presence of other artifacts is reflected by the `has_*`
    /// predicates on the returned handle.
    pub fn entry(&self, name: &str) -> Result<StoreEntry<'_>> {
        let _index = self.index.read().expect("store index lock poisoned");
        if !self.has_artifact(name, ATTRIBUTES_EXTENSION) {
            return Err(Error::NotFound(name.to_string()));
        }
        Ok(StoreEntry {
            name: name.to_string(),
            store: self,
        })
    }

    /// Create a `.key + .crt + .json` entry from the given factory under the
    /// atomic file-group protocol: either every artifact becomes durable or
    /// no file of the name remains.
    pub fn create_certificate(
        &self,
        name: &str,
        factory: CertificateFactory,
    ) -> Result<StoreEntry<'_>> {
        let mut index = self.index.write().expect("store index lock poisoned");
        let mut files = FileGroup::new(
            &self.path,
            name,
            &[KEY_EXTENSION, CRT_EXTENSION, ATTRIBUTES_EXTENSION],
        );
        files.create(KEY_EXTENSION)?;
        files.create(CRT_EXTENSION)?;
        files.create(ATTRIBUTES_EXTENSION)?;
        let attributes = StoreEntryAttributes {
            provider: factory.name(),
        };
        let (key, certificate) = factory.produce()?;
        self.write_key(name, files.file(KEY_EXTENSION)?, &key)?;
        self.write_certificate(name, files.file(CRT_EXTENSION)?, &certificate)?;
        self.write_attributes(name, files.file(ATTRIBUTES_EXTENSION)?, &attributes)?;
        files.keep();
        drop(files);
        index.push(name.to_string());
        index.sort();
        Ok(StoreEntry {
            name: name.to_string(),
            store: self,
        })
    }

    /// Create a `.key + .csr + .json` entry from the given factory, with the
    /// same commit guarantees as [`FsStore::create_certificate`].
    pub fn create_certificate_request(
        &self,
        name: &str,
        factory: CertificateRequestFactory,
    ) -> Result<StoreEntry<'_>> {
        let mut index = self.index.write().expect("store index lock poisoned");
        let mut files = FileGroup::new(
            &self.path,
            name,
            &[KEY_EXTENSION, CSR_EXTENSION, ATTRIBUTES_EXTENSION],
        );
        files.create(KEY_EXTENSION)?;
        files.create(CSR_EXTENSION)?;
        files.create(ATTRIBUTES_EXTENSION)?;
        let attributes = StoreEntryAttributes {
            provider: factory.name(),
        };
        let (key, certificate_request) = factory.produce()?;
        self.write_key(name, files.file(KEY_EXTENSION)?, &key)?;
        self.write_certificate_request(
            name,
            files.file(CSR_EXTENSION)?,
            &certificate_request,
        )?;
        self.write_attributes(name, files.file(ATTRIBUTES_EXTENSION)?, &attributes)?;
        files.keep();
        drop(files);
        index.push(name.to_string());
        index.sort();
        Ok(StoreEntry {
            name: name.to_string(),
            store: self,
        })
    }

    fn artifact_path(&self, name: &str, extension: &str) -> PathBuf {
        self.path.join(format!("{}{}", name, extension))
    }

    fn has_artifact(&self, name: &str, extension: &str) -> bool {
        self.artifact_path(name, extension).is_file()
    }

    fn write_key(&self, name: &str, file: &mut File, key: &PKey<Private>) -> Result<()> {
        info!(entry = %name, "Writing key file...");
        let pkcs8_der = key.private_key_to_pkcs8()?;
        let pem = encrypt_private_key_pem(&pkcs8_der, &self.secret.unwrap_bytes())?;
        file.write_all(pem.as_bytes())?;
        Ok(())
    }

    /// Keys are parsed and decrypted on every read; they are never cached.
    fn read_key(&self, name: &str) -> Result<Option<PKey<Private>>> {
        let key_path = self.artifact_path(name, KEY_EXTENSION);
        info!(file = %key_path.display(), "Reading key file...");
        let key_bytes = match fs::read(&key_path) {
            Ok(key_bytes) => key_bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let block = decode_single_block(&key_bytes)?;
        let pkcs8_der = decrypt_private_key_pem(&block, &self.secret.unwrap_bytes())?;
        Ok(Some(PKey::private_key_from_pkcs8(&pkcs8_der)?))
    }

    fn write_certificate(&self, name: &str, file: &mut File, certificate: &X509) -> Result<()> {
        info!(entry = %name, "Writing certificate file...");
        file.write_all(&certificate.to_pem()?)?;
        Ok(())
    }

    fn read_certificate(&self, name: &str) -> Result<Option<Arc<X509>>> {
        let crt_path = self.artifact_path(name, CRT_EXTENSION);
        if let Some(cached) = self
            .certificate_cache
            .lock()
            .expect("certificate cache lock poisoned")
            .get(name)
        {
            debug!(file = %crt_path.display(), "Using cached certificate");
            return Ok(Some(cached.clone()));
        }
        info!(file = %crt_path.display(), "Reading certificate file...");
        let crt_bytes = match fs::read(&crt_path) {
            Ok(crt_bytes) => crt_bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let block = decode_single_block(&crt_bytes)?;
        block.expect_tag(CERTIFICATE_TAG)?;
        let certificate = Arc::new(X509::from_der(&block.data)?);
        self.certificate_cache
            .lock()
            .expect("certificate cache lock poisoned")
            .put(name.to_string(), certificate.clone());
        Ok(Some(certificate))
    }

    fn write_certificate_request(
        &self,
        name: &str,
        file: &mut File,
        certificate_request: &X509Req,
    ) -> Result<()> {
        info!(entry = %name, "Writing certificate request file...");
        file.write_all(&certificate_request.to_pem()?)?;
        Ok(())
    }

    fn read_certificate_request(&self, name: &str) -> Result<Option<Arc<X509Req>>> {
        let csr_path = self.artifact_path(name, CSR_EXTENSION);
        if let Some(cached) = self
            .certificate_request_cache
            .lock()
            .expect("certificate request cache lock poisoned")
            .get(name)
        {
            debug!(file = %csr_path.display(), "Using cached certificate request");
            return Ok(Some(cached.clone()));
        }
        info!(file = %csr_path.display(), "Reading certificate request file...");
        let csr_bytes = match fs::read(&csr_path) {
            Ok(csr_bytes) => csr_bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let block = decode_single_block(&csr_bytes)?;
        block.expect_tag(CERTIFICATE_REQUEST_TAG)?;
        let certificate_request = Arc::new(X509Req::from_der(&block.data)?);
        self.certificate_request_cache
            .lock()
            .expect("certificate request cache lock poisoned")
            .put(name.to_string(), certificate_request.clone());
        Ok(Some(certificate_request))
    }

    fn read_revocation_list(&self, name: &str) -> Result<Option<Arc<X509Crl>>> {
        let crl_path = self.artifact_path(name, CRL_EXTENSION);
        if let Some(cached) = self
            .revocation_list_cache
            .lock()
            .expect("revocation list cache lock poisoned")
            .get(name)
        {
            debug!(file = %crl_path.display(), "Using cached revocation list");
            return Ok(Some(cached.clone()));
        }
        info!(file = %crl_path.display(), "Reading revocation list file...");
        let crl_bytes = match fs::read(&crl_path) {
            Ok(crl_bytes) => crl_bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let block = decode_single_block(&crl_bytes)?;
        block.expect_tag(REVOCATION_LIST_TAG)?;
        let revocation_list = Arc::new(X509Crl::from_der(&block.data)?);
        self.revocation_list_cache
            .lock()
            .expect("revocation list cache lock poisoned")
            .put(name.to_string(), revocation_list.clone());
        Ok(Some(revocation_list))
    }

    fn write_attributes(
        &self,
        name: &str,
        file: &mut File,
        attributes: &StoreEntryAttributes,
    ) -> Result<()> {
        info!(entry = %name, "Writing attributes file...");
        file.write_all(&serde_json::to_vec_pretty(attributes)?)?;
        Ok(())
    }

    fn read_attributes(&self, name: &str) -> Result<Arc<StoreEntryAttributes>> {
        let attributes_path = self.artifact_path(name, ATTRIBUTES_EXTENSION);
        if let Some(cached) = self
            .attributes_cache
            .lock()
            .expect("attributes cache lock poisoned")
            .get(name)
        {
            debug!(file = %attributes_path.display(), "Using cached attributes");
            return Ok(cached.clone());
        }
        info!(file = %attributes_path.display(), "Reading attributes file...");
        let attributes_bytes = match fs::read(&attributes_path) {
            Ok(attributes_bytes) => attributes_bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(Error::NotFound(name.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        let attributes: Arc<StoreEntryAttributes> =
            Arc::new(serde_json::from_slice(&attributes_bytes)?);
        self.attributes_cache
            .lock()
            .expect("attributes cache lock poisoned")
            .put(name.to_string(), attributes.clone());
        Ok(attributes)
    }
}

fn store_file_options() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(STORE_FILE_MODE);
    }
    options
}

fn strip_store_extension(file_name: &str) -> Option<&str> {
    STORE_EXTENSIONS
        .iter()
        .find_map(|extension| file_name.strip_suffix(extension))
        .filter(|entry_name| !entry_name.is_empty())
}

/// Forward-only, resettable cursor over an index snapshot.
pub struct StoreEntries<'a> {
    store: &'a FsStore,
    entries: Vec<String>,
    next: usize,
}

impl<'a> StoreEntries<'a> {
    pub fn reset(&mut self) {
        self.next = 0;
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<StoreEntry<'a>> {
        let name = self.entries.get(self.next)?.clone();
        self.next += 1;
        Some(StoreEntry {
            name,
            store: self.store,
        })
    }
}

/// Transient handle onto one store entry; all reads delegate to the store.
pub struct StoreEntry<'a> {
    name: String,
    store: &'a FsStore,
}

impl StoreEntry<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_key(&self) -> bool {
        self.store.has_artifact(&self.name, KEY_EXTENSION)
    }

    pub fn key(&self) -> Result<Option<PKey<Private>>> {
        self.store.read_key(&self.name)
    }

    pub fn has_certificate(&self) -> bool {
        self.store.has_artifact(&self.name, CRT_EXTENSION)
    }

    pub fn certificate(&self) -> Result<Option<Arc<X509>>> {
        self.store.read_certificate(&self.name)
    }

    pub fn has_certificate_request(&self) -> bool {
        self.store.has_artifact(&self.name, CSR_EXTENSION)
    }

    pub fn certificate_request(&self) -> Result<Option<Arc<X509Req>>> {
        self.store.read_certificate_request(&self.name)
    }

    pub fn has_revocation_list(&self) -> bool {
        self.store.has_artifact(&self.name, CRL_EXTENSION)
    }

    pub fn revocation_list(&self) -> Result<Option<Arc<X509Crl>>> {
        self.store.read_revocation_list(&self.name)
    }

    pub fn attributes(&self) -> Result<Arc<StoreEntryAttributes>> {
        self.store.read_attributes(&self.name)
    }
}

/// Staged target files of one entry creation. Files are opened
/// create-exclusive; unless [`FileGroup::keep`] is called every staged file
/// is removed again on drop, so a failed creation leaves nothing behind.
struct FileGroup {
    name: String,
    staged: Vec<StagedFile>,
    keep: bool,
}

struct StagedFile {
    extension: &'static str,
    path: PathBuf,
    file: Option<File>,
}

impl FileGroup {
    fn new(store_path: &Path, name: &str, extensions: &[&'static str]) -> Self {
        let staged = extensions
            .iter()
            .map(|extension| StagedFile {
                extension,
                path: store_path.join(format!("{}{}", name, extension)),
                file: None,
            })
            .collect();
        Self {
            name: name.to_string(),
            staged,
            keep: false,
        }
    }

    fn create(&mut self, extension: &str) -> Result<()> {
        for staged in &mut self.staged {
            if staged.extension != extension {
                continue;
            }
            if staged.file.is_none() {
                let file = store_file_options().open(&staged.path).map_err(|err| {
                    if err.kind() == ErrorKind::AlreadyExists {
                        Error::AlreadyExists(self.name.clone())
                    } else {
                        Error::from(err)
                    }
                })?;
                staged.file = Some(file);
            }
            return Ok(());
        }
        Err(Error::InvalidRequest(format!(
            "{} file not part of file group",
            extension
        )))
    }

    fn file(&mut self, extension: &str) -> Result<&mut File> {
        self.staged
            .iter_mut()
            .find(|staged| staged.extension == extension)
            .and_then(|staged| staged.file.as_mut())
            .ok_or_else(|| {
                Error::InvalidRequest(format!("{} file not part of file group", extension))
            })
    }

    fn keep(&mut self) {
        self.keep = true;
    }
}

impl Drop for FileGroup {
    fn drop(&mut self) {
        for staged in &mut self.staged {
            if let Some(file) = staged.file.take() {
                drop(file);
                if !self.keep {
                    debug!(file = %staged.path.display(), "Removing uncommitted file...");
                    if let Err(err) = fs::remove_file(&staged.path) {
                        warn!(file = %staged.path.display(), error = %err, "Failed to remove uncommitted file");
                    }
                }
            }
        }
    }
}
