//! API-key storage/rotation, trusted-subnet matching, and one-shot tokens.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::config::GatewayConfig;
use crate::error::GatewayError;

const KEY_LEN: usize = 32;
const ONE_SHOT_TTL: Duration = Duration::from_secs(5);
const BASE32_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

fn random_base32(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let idx = rng.random_range(0..BASE32_ALPHABET.len());
            BASE32_ALPHABET[idx] as char
        })
        .collect()
}

pub struct AuthGate {
    config: Arc<RwLock<GatewayConfig>>,
    key_file: PathBuf,
    api_key: RwLock<String>,
    one_shot_tokens: Mutex<HashMap<String, Instant>>,
}

impl AuthGate {
    /// Load the persisted API key from `<api_key_path>/.klippy_api_key`,
    /// generating and persisting a fresh one if absent. `config` is the same
    /// shared handle the rest of `AppState` holds, so a host `register_config`
    /// overlay (require_auth, trusted_clients, ...) takes effect here too,
    /// without a stale private copy.
    pub fn load_or_create(config: Arc<RwLock<GatewayConfig>>) -> std::io::Result<Self> {
        let api_key_path = config
            .try_read()
            .expect("config must not be shared with other readers before AuthGate owns it")
            .api_key_path
            .clone();
        let key_file = api_key_path.join(".klippy_api_key");
        let key = match std::fs::read_to_string(&key_file) {
            Ok(s) => s.trim().to_owned(),
            Err(_) => {
                let key = random_base32(KEY_LEN);
                write_key_file(&key_file, &key)?;
                key
            }
        };
        Ok(Self {
            config,
            key_file,
            api_key: RwLock::new(key),
            one_shot_tokens: Mutex::new(HashMap::new()),
        })
    }

    pub async fn current_key(&self) -> String {
        self.api_key.read().await.clone()
    }

    /// Generate a fresh key, persist it atomically, and make it the only
    /// key accepted from the next request onward.
    pub async fn rotate(&self) -> std::io::Result<String> {
        let key = random_base32(KEY_LEN);
        write_key_file(&self.key_file, &key)?;
        *self.api_key.write().await = key.clone();
        info!("api key rotated");
        Ok(key)
    }

    pub async fn is_trusted_addr(&self, addr: Ipv4Addr) -> bool {
        self.config
            .read()
            .await
            .trusted_clients
            .iter()
            .any(|subnet| subnet.contains(addr))
    }

    pub async fn require_auth(&self) -> bool {
        self.config.read().await.require_auth
    }

    /// Trusted-only admission, used for one-shot token minting: an API key
    /// does not count here (it would let a key holder farm tokens), only
    /// `require_auth = false` or a matching trusted subnet do.
    pub async fn admit_trusted(&self, remote_addr: Option<Ipv4Addr>) -> Result<(), GatewayError> {
        if !self.require_auth().await {
            return Ok(());
        }
        if let Some(addr) = remote_addr {
            if self.is_trusted_addr(addr).await {
                return Ok(());
            }
        }
        Err(GatewayError::Unauthorized)
    }

    pub async fn mint_one_shot_token(&self) -> String {
        let token = random_base32(KEY_LEN);
        let deadline = Instant::now() + ONE_SHOT_TTL;
        let mut tokens = self.one_shot_tokens.lock().await;
        prune(&mut tokens);
        tokens.insert(token.clone(), deadline);
        token
    }

    /// Consume a one-shot token; returns true exactly once per valid token.
    pub async fn consume_one_shot_token(&self, token: &str) -> bool {
        let mut tokens = self.one_shot_tokens.lock().await;
        prune(&mut tokens);
        match tokens.remove(token) {
            Some(deadline) => Instant::now() <= deadline,
            None => false,
        }
    }

    /// Classify an incoming request. `trusted` bypasses key/token checks
    /// entirely; otherwise the caller must supply a valid API key or a
    /// still-live one-shot token.
    pub async fn admit(
        &self,
        remote_addr: Option<Ipv4Addr>,
        api_key_header: Option<&str>,
        one_shot_token: Option<&str>,
    ) -> Result<(), GatewayError> {
        self.admit_with_trust(remote_addr, api_key_header, one_shot_token)
            .await
            .map(|_trusted| ())
    }

    /// Same admission check as `admit`, but also reports whether the client
    /// was admitted *because it is trusted* (subnet match or auth disabled)
    /// as opposed to via API key or one-shot token. A long-lived WebSocket
    /// connection records this so that later RPC calls over the same socket
    /// (e.g. `get_access_oneshot_token`) can still enforce the
    /// trusted-client-only rule even though the connection itself already
    /// passed general admission.
    pub async fn admit_with_trust(
        &self,
        remote_addr: Option<Ipv4Addr>,
        api_key_header: Option<&str>,
        one_shot_token: Option<&str>,
    ) -> Result<bool, GatewayError> {
        if !self.require_auth().await {
            return Ok(true);
        }
        if let Some(addr) = remote_addr {
            if self.is_trusted_addr(addr).await {
                return Ok(true);
            }
        }
        if let Some(key) = api_key_header {
            if key == self.current_key().await {
                return Ok(false);
            }
        }
        if let Some(token) = one_shot_token {
            if self.consume_one_shot_token(token).await {
                return Ok(false);
            }
        }
        Err(GatewayError::Unauthorized)
    }
}

fn prune(tokens: &mut HashMap<String, Instant>) {
    let now = Instant::now();
    tokens.retain(|_, deadline| *deadline >= now);
}

fn write_key_file(path: &Path, key: &str) -> std::io::Result<()> {
    use std::io::Write;
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(key.as_bytes())?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_subnet(cidr: &str) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.trusted_clients = vec![crate::config::TrustedSubnet::parse(cidr).unwrap()];
        config
    }

    fn shared(config: GatewayConfig) -> Arc<RwLock<GatewayConfig>> {
        Arc::new(RwLock::new(config))
    }

    #[tokio::test]
    async fn generates_and_persists_key_on_first_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = GatewayConfig::default();
        config.api_key_path = dir.path().to_path_buf();
        let gate = AuthGate::load_or_create(shared(config)).unwrap();
        let key = gate.current_key().await;
        assert_eq!(key.len(), KEY_LEN);
        let persisted = std::fs::read_to_string(dir.path().join(".klippy_api_key")).unwrap();
        assert_eq!(persisted.trim(), key);
    }

    #[tokio::test]
    async fn rotate_replaces_key_and_rejects_the_old_one() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = GatewayConfig::default();
        config.api_key_path = dir.path().to_path_buf();
        let gate = AuthGate::load_or_create(shared(config)).unwrap();
        let old = gate.current_key().await;
        let new = gate.rotate().await.unwrap();
        assert_ne!(old, new);
        assert_eq!(gate.current_key().await, new);
    }

    #[tokio::test]
    async fn one_shot_token_is_single_use() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = GatewayConfig::default();
        config.api_key_path = dir.path().to_path_buf();
        let gate = AuthGate::load_or_create(shared(config)).unwrap();
        let token = gate.mint_one_shot_token().await;
        assert!(gate.consume_one_shot_token(&token).await);
        assert!(!gate.consume_one_shot_token(&token).await);
    }

    #[tokio::test]
    async fn admit_allows_trusted_subnet_without_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_with_subnet("10.0.0.0/24");
        config.api_key_path = dir.path().to_path_buf();
        let gate = AuthGate::load_or_create(shared(config)).unwrap();
        gate.admit(Some("10.0.0.5".parse().unwrap()), None, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn admit_rejects_unknown_client_without_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = GatewayConfig::default();
        config.api_key_path = dir.path().to_path_buf();
        let gate = AuthGate::load_or_create(shared(config)).unwrap();
        let err = gate
            .admit(Some("8.8.8.8".parse().unwrap()), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unauthorized));
    }

    #[tokio::test]
    async fn admit_accepts_valid_api_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = GatewayConfig::default();
        config.api_key_path = dir.path().to_path_buf();
        let gate = AuthGate::load_or_create(shared(config)).unwrap();
        let key = gate.current_key().await;
        gate.admit(Some("8.8.8.8".parse().unwrap()), Some(&key), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn shared_config_overlay_is_visible_without_rebuilding_the_gate() {
        // Mirrors what `host_link::handle_register_config` does: mutate the
        // same `Arc<RwLock<GatewayConfig>>` the gate was built from, in place.
        let dir = tempfile::tempdir().unwrap();
        let mut config = GatewayConfig::default();
        config.api_key_path = dir.path().to_path_buf();
        config.require_auth = true;
        let config = shared(config);
        let gate = AuthGate::load_or_create(Arc::clone(&config)).unwrap();
        gate.admit(Some("8.8.8.8".parse().unwrap()), None, None)
            .await
            .unwrap_err();

        config.write().await.require_auth = false;

        gate.admit(Some("8.8.8.8".parse().unwrap()), None, None)
            .await
            .unwrap();
    }
}
