//! Persisted user settings: identity keys, nickname, favorites, blocked identities, channel
//! passwords and retained channels. Plain key-value, rewritten whole on every change.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Mutex;

use hop_core::{Fingerprint, Identity};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Hex of the long-lived secret keys.
    pub identity: Option<String>,
    pub nickname: Option<String>,
    pub favorites: BTreeSet<String>,
    pub blocked: BTreeSet<String>,
    pub channel_passwords: BTreeMap<String, String>,
    pub retained_channels: BTreeSet<String>,
}

impl Settings {
    /// Stored identity, if present and well formed.
    pub fn identity(&self) -> Option<Identity> {
        let bytes = hex::decode(self.identity.as_deref()?).ok()?;
        let secret: [u8; 64] = bytes.try_into().ok()?;
        Some(Identity::from_secret_bytes(&secret))
    }

    pub fn set_identity(&mut self, identity: &Identity) {
        self.identity = Some(hex::encode(identity.secret_bytes()));
    }

    pub fn favorite_fingerprints(&self) -> impl Iterator<Item = Fingerprint> + '_ {
        self.favorites.iter().map(|f| Fingerprint::from(f.as_str()))
    }

    pub fn blocked_fingerprints(&self) -> impl Iterator<Item = Fingerprint> + '_ {
        self.blocked.iter().map(|f| Fingerprint::from(f.as_str()))
    }

    pub fn set_favorite(&mut self, fingerprint: &Fingerprint, favorite: bool) {
        toggle(&mut self.favorites, fingerprint.as_str(), favorite);
    }

    pub fn set_blocked(&mut self, fingerprint: &Fingerprint, blocked: bool) {
        toggle(&mut self.blocked, fingerprint.as_str(), blocked);
    }

    pub fn set_retained(&mut self, channel: &str, retained: bool) {
        toggle(&mut self.retained_channels, channel, retained);
    }
}

fn toggle(set: &mut BTreeSet<String>, key: &str, on: bool) {
    if on {
        set.insert(key.to_string());
    } else {
        set.remove(key);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("settings io: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings file invalid: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("settings not serializable: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("settings store poisoned")]
    Poisoned,
}

pub trait SettingsStore: Send + Sync {
    fn load(&self) -> Result<Settings, SettingsError>;
    fn save(&self, settings: &Settings) -> Result<(), SettingsError>;
}

/// Settings that live as long as the process.
#[derive(Default)]
pub struct MemorySettings {
    inner: Mutex<Settings>,
}

impl MemorySettings {
    pub fn new(initial: Settings) -> Self {
        Self {
            inner: Mutex::new(initial),
        }
    }
}

impl SettingsStore for MemorySettings {
    fn load(&self) -> Result<Settings, SettingsError> {
        self.inner
            .lock()
            .map(|s| s.clone())
            .map_err(|_| SettingsError::Poisoned)
    }

    fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        let mut inner = self.inner.lock().map_err(|_| SettingsError::Poisoned)?;
        *inner = settings.clone();
        Ok(())
    }
}

/// TOML file. A missing file reads as empty settings.
pub struct FileSettings {
    path: PathBuf,
}

impl FileSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SettingsStore for FileSettings {
    fn load(&self) -> Result<Settings, SettingsError> {
        match std::fs::read_to_string(&self.path) {
            Ok(s) => Ok(toml::from_str(&s)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Settings::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let text = toml::to_string(settings)?;
        let tmp = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_settings_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSettings::new(dir.path().join("nested/settings.toml"));
        assert_eq!(store.load().unwrap(), Settings::default());

        let mut settings = Settings {
            nickname: Some("alice".into()),
            ..Settings::default()
        };
        settings.set_favorite(&Fingerprint::from("fp-bob"), true);
        settings.set_blocked(&Fingerprint::from("fp-mallory"), true);
        settings
            .channel_passwords
            .insert("#ops".into(), "secret123".into());
        settings.set_retained("#ops", true);
        store.save(&settings).unwrap();

        let back = FileSettings::new(dir.path().join("nested/settings.toml"))
            .load()
            .unwrap();
        assert_eq!(back, settings);
        assert_eq!(
            back.favorite_fingerprints().collect::<Vec<_>>(),
            vec![Fingerprint::from("fp-bob")]
        );
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "favorites = 3").unwrap();
        assert!(matches!(
            FileSettings::new(path).load(),
            Err(SettingsError::Parse(_))
        ));
    }

    #[test]
    fn identity_restored_from_store() {
        let mut settings = Settings::default();
        assert!(settings.identity().is_none());
        let id = Identity::generate();
        settings.set_identity(&id);
        assert_eq!(settings.identity().unwrap().fingerprint(), id.fingerprint());
        settings.identity = Some("00ff".into());
        assert!(settings.identity().is_none());
    }

    #[test]
    fn toggles_are_idempotent() {
        let mut settings = Settings::default();
        let fp = Fingerprint::from("x");
        settings.set_favorite(&fp, true);
        settings.set_favorite(&fp, true);
        assert_eq!(settings.favorites.len(), 1);
        settings.set_favorite(&fp, false);
        assert!(settings.favorites.is_empty());
    }
}
