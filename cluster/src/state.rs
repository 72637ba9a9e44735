use datagrid_common::{now_millis, GridError, Result, View};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Magic number at the head of a locator state file ("LOCV")
const STATE_MAGIC: u32 = 0x4C4F_4356;

const STATE_VERSION: u32 = 1;

/// magic + version + length + checksum
const HEADER_LEN: usize = 16;

/// Upper bound on a sane payload
const MAX_STATE_LEN: usize = 64 * 1024 * 1024;

/// What a locator remembers across restarts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocatorState {
    pub endpoint: SocketAddr,
    pub view: View,
    pub saved_at_ms: u64,
}

impl LocatorState {
    pub fn new(endpoint: SocketAddr, view: View) -> Self {
        Self {
            endpoint,
            view,
            saved_at_ms: now_millis(),
        }
    }
}

fn calculate_checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Encode a state record: `[MAGIC][VERSION][LENGTH][CRC32][DATA]`, all
/// integers little-endian
pub fn encode_state(state: &LocatorState) -> Result<Vec<u8>> {
    let payload = bincode::serialize(state).map_err(|e| GridError::Serialization(e.to_string()))?;

    let mut buffer = Vec::with_capacity(HEADER_LEN + payload.len());
    buffer.extend_from_slice(&STATE_MAGIC.to_le_bytes());
    buffer.extend_from_slice(&STATE_VERSION.to_le_bytes());
    buffer.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buffer.extend_from_slice(&calculate_checksum(&payload).to_le_bytes());
    buffer.extend_from_slice(&payload);
    Ok(buffer)
}

/// Decode a state record, rejecting anything that does not check out
pub fn decode_state(bytes: &[u8]) -> Result<LocatorState> {
    if bytes.len() < HEADER_LEN {
        return Err(GridError::Corruption(format!(
            "locator state is {} bytes, shorter than its header",
            bytes.len()
        )));
    }

    let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);

    let magic = word(0);
    if magic != STATE_MAGIC {
        return Err(GridError::Corruption(format!(
            "bad locator state magic: expected {:x}, got {:x}",
            STATE_MAGIC, magic
        )));
    }

    let version = word(4);
    if version != STATE_VERSION {
        return Err(GridError::Corruption(format!(
            "unsupported locator state version {}",
            version
        )));
    }

    let length = word(8) as usize;
    if length > MAX_STATE_LEN || bytes.len() - HEADER_LEN != length {
        return Err(GridError::Corruption(format!(
            "locator state length {} does not match {} payload bytes",
            length,
            bytes.len() - HEADER_LEN
        )));
    }

    let payload = &bytes[HEADER_LEN..];
    let expected = word(12);
    let actual = calculate_checksum(payload);
    if expected != actual {
        return Err(GridError::Corruption(format!(
            "locator state checksum mismatch: expected {:x}, got {:x}",
            expected, actual
        )));
    }

    bincode::deserialize(payload)
        .map_err(|e| GridError::Corruption(format!("undecodable locator state: {}", e)))
}

/// The on-disk home of a locator's last known view
#[derive(Debug, Clone)]
pub struct LocatorStateFile {
    path: PathBuf,
}

impl LocatorStateFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Conventional file name for the locator on `port`
    pub fn default_name(port: u16) -> PathBuf {
        PathBuf::from(format!("locator{}view.dat", port))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist the state, replacing the previous file atomically
    pub async fn save(&self, state: &LocatorState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let encoded = encode_state(state)?;
        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);

        let mut file = tokio::fs::File::create(&temp).await?;
        file.write_all(&encoded).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temp, &self.path).await?;

        tracing::debug!(
            "Saved locator state: path={}, view_id={}",
            self.path.display(),
            state.view.id()
        );
        Ok(())
    }

    /// Load the state; `None` when no file exists yet
    pub async fn load(&self) -> Result<Option<LocatorState>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => decode_state(&bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datagrid_common::{Member, MemberKind};
    use tempfile::TempDir;

    fn sample_state() -> LocatorState {
        let loc = Member::with_timestamp(
            "127.0.0.1:10334".parse().unwrap(),
            MemberKind::Locator,
            1,
        );
        let peer = Member::with_timestamp(
            "127.0.0.1:41000".parse().unwrap(),
            MemberKind::Normal,
            2,
        );
        let view = View::new(6, loc.clone(), vec![loc, peer], vec![]);
        LocatorState::new("127.0.0.1:10334".parse().unwrap(), view)
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let file = LocatorStateFile::new(dir.path().join(LocatorStateFile::default_name(10334)));
        let state = sample_state();

        file.save(&state).await.unwrap();
        let loaded = file.load().await.unwrap().unwrap();

        assert_eq!(loaded, state);
        assert!(file.path().ends_with("locator10334view.dat"));
    }

    #[tokio::test]
    async fn test_missing_file_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let file = LocatorStateFile::new(dir.path().join("absent.dat"));
        assert!(file.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_flipped_byte_is_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.dat");
        let mut bytes = encode_state(&sample_state()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        tokio::fs::write(&path, &bytes).await.unwrap();

        let err = LocatorStateFile::new(&path).load().await.unwrap_err();
        assert!(matches!(err, GridError::Corruption(_)));
    }

    #[test]
    fn test_header_checks() {
        assert!(matches!(decode_state(&[1, 2, 3]), Err(GridError::Corruption(_))));

        let mut bytes = encode_state(&sample_state()).unwrap();
        bytes[0] = 0;
        assert!(matches!(decode_state(&bytes), Err(GridError::Corruption(_))));

        let mut bytes = encode_state(&sample_state()).unwrap();
        bytes.push(0);
        assert!(matches!(decode_state(&bytes), Err(GridError::Corruption(_))));
    }
}
