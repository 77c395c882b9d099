use std::path::PathBuf;

/// Maximum length for column, index and schema names.
pub const IDENTIFIER_SIZE: usize = 64;

/// Default field separator of the text record format.
pub const SEPARATOR: char = ',';

/// Prefix of the two-character escape sequences of the text record format.
pub const ESCAPE_PREFIX: char = '/';

/// Substitute character written after [`ESCAPE_PREFIX`] in place of the
/// separator.
pub const ESCAPE_SEPARATOR: char = '.';

/// Name of the implicit change tracking column holding the last store time.
pub const LAST_STORED_AT: &str = "LastStoredAt";

/// Name of the implicit change tracking column holding the last export time.
pub const LAST_EXPORTED_AT: &str = "LastExportedAt";

/// Magic bytes at the start of every data file.
pub const FILE_MAGIC: &[u8; 11] = b"fieldstore\0";

/// Current data file format version.
pub const FILE_FORMAT_VERSION: u16 = 1;

/// Data file suffix.
pub const DATA_FILE_SUFFIX: &str = "fsdb";

/// Inserted between the base name and the timestamp of labelled backup files.
pub const BACKUP_SUFFIX: &str = "_Backup_";

/// `chrono` format of backup file timestamps.
pub const BACKUP_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Suffix of the temporary file written before an atomic rename.
pub const TEMP_FILE_SUFFIX: &str = "tmp";

/// Options of a [`FileRecordStore`](crate::store::FileRecordStore).
#[derive(Debug, Clone)]
pub struct FileStoreOpts {
    /// The folder holding the data file.
    pub folder: PathBuf,
    /// The data file name, without suffix.
    pub base_name: String,
    /// Whether backup file names get a timestamp label.
    pub label_backups: bool,
}

impl FileStoreOpts {
    /// Creates options for the given folder and base name; backups are
    /// labelled.
    pub fn new(folder: impl Into<PathBuf>, base_name: impl Into<String>) -> FileStoreOpts {
        FileStoreOpts {
            folder: folder.into(),
            base_name: base_name.into(),
            label_backups: true,
        }
    }

    /// Returns the data file path.
    pub fn data_path(&self) -> PathBuf {
        self.folder
            .join(format!("{}.{DATA_FILE_SUFFIX}", self.base_name))
    }
}
